//! Administrative protocol against sharded KV members.
//!
//! Commands are plain RESP2 arrays sent over a short-lived TCP connection,
//! one command per connection. The cluster-wide fix has no single-command
//! equivalent, so [`RespAdmin`] delegates it to an external `redis-cli`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::error::{ClusterError, Result};
use crate::node::{NodeAddr, NodeId};
use crate::slot_map::Slot;

/// Target state for `CLUSTER SETSLOT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetSlotState {
    /// Claimed by the receiving node, data still coming from the named source.
    Importing(NodeId),
    /// Still served by the receiving node, leaving for the named destination.
    Migrating(NodeId),
    /// Final owner.
    Node(NodeId),
    /// Clear importing/migrating markers.
    Stable,
}

/// A single administrative request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Ping,
    ClusterMyId,
    ClusterNodes,
    Meet(NodeAddr),
    Forget(NodeId),
    AddSlots(Vec<Slot>),
    SetSlot { slot: Slot, state: SetSlotState },
    GetKeysInSlot { slot: Slot, count: usize },
    Migrate {
        dest: NodeAddr,
        keys: Vec<Bytes>,
        timeout_ms: u64,
    },
    Shutdown,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Ping => "PING",
            AdminCommand::ClusterMyId => "CLUSTER MYID",
            AdminCommand::ClusterNodes => "CLUSTER NODES",
            AdminCommand::Meet(_) => "CLUSTER MEET",
            AdminCommand::Forget(_) => "CLUSTER FORGET",
            AdminCommand::AddSlots(_) => "CLUSTER ADDSLOTS",
            AdminCommand::SetSlot { .. } => "CLUSTER SETSLOT",
            AdminCommand::GetKeysInSlot { .. } => "CLUSTER GETKEYSINSLOT",
            AdminCommand::Migrate { .. } => "MIGRATE",
            AdminCommand::Shutdown => "SHUTDOWN",
        }
    }

    /// Encode as a RESP2 request array.
    pub fn to_frame(&self) -> BytesFrame {
        let mut args: Vec<Bytes> = Vec::new();
        match self {
            AdminCommand::Ping => args.push(Bytes::from_static(b"PING")),
            AdminCommand::ClusterMyId => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"MYID"));
            }
            AdminCommand::ClusterNodes => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"NODES"));
            }
            AdminCommand::Meet(addr) => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"MEET"));
                args.push(text(&addr.host));
                args.push(text(addr.port.to_string()));
            }
            AdminCommand::Forget(id) => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"FORGET"));
                args.push(text(id.as_str()));
            }
            AdminCommand::AddSlots(slots) => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"ADDSLOTS"));
                args.extend(slots.iter().map(|s| text(s.to_string())));
            }
            AdminCommand::SetSlot { slot, state } => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"SETSLOT"));
                args.push(text(slot.to_string()));
                match state {
                    SetSlotState::Importing(id) => {
                        args.push(Bytes::from_static(b"IMPORTING"));
                        args.push(text(id.as_str()));
                    }
                    SetSlotState::Migrating(id) => {
                        args.push(Bytes::from_static(b"MIGRATING"));
                        args.push(text(id.as_str()));
                    }
                    SetSlotState::Node(id) => {
                        args.push(Bytes::from_static(b"NODE"));
                        args.push(text(id.as_str()));
                    }
                    SetSlotState::Stable => args.push(Bytes::from_static(b"STABLE")),
                }
            }
            AdminCommand::GetKeysInSlot { slot, count } => {
                args.push(Bytes::from_static(b"CLUSTER"));
                args.push(Bytes::from_static(b"GETKEYSINSLOT"));
                args.push(text(slot.to_string()));
                args.push(text(count.to_string()));
            }
            AdminCommand::Migrate {
                dest,
                keys,
                timeout_ms,
            } => {
                // MIGRATE host port "" 0 timeout KEYS k1 k2 ...
                args.push(Bytes::from_static(b"MIGRATE"));
                args.push(text(&dest.host));
                args.push(text(dest.port.to_string()));
                args.push(Bytes::new());
                args.push(Bytes::from_static(b"0"));
                args.push(text(timeout_ms.to_string()));
                args.push(Bytes::from_static(b"KEYS"));
                args.extend(keys.iter().cloned());
            }
            AdminCommand::Shutdown => {
                args.push(Bytes::from_static(b"SHUTDOWN"));
                args.push(Bytes::from_static(b"NOSAVE"));
            }
        }
        BytesFrame::Array(args.into_iter().map(BytesFrame::BulkString).collect())
    }
}

fn text(value: impl AsRef<str>) -> Bytes {
    Bytes::from(value.as_ref().as_bytes().to_vec())
}

/// Decoded reply to an administrative command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminReply {
    Ok,
    /// `MIGRATE` found none of the keys at the source.
    NoKey,
    Text(String),
    Integer(i64),
    Keys(Vec<Bytes>),
}

impl AdminReply {
    pub fn into_text(self, target: &NodeAddr) -> Result<String> {
        match self {
            AdminReply::Text(text) => Ok(text),
            other => Err(ClusterError::protocol(
                target,
                format!("expected text reply, got {other:?}"),
            )),
        }
    }

    pub fn into_keys(self, target: &NodeAddr) -> Result<Vec<Bytes>> {
        match self {
            AdminReply::Keys(keys) => Ok(keys),
            other => Err(ClusterError::protocol(
                target,
                format!("expected key list, got {other:?}"),
            )),
        }
    }
}

/// Transport for administrative commands.
///
/// The controller never talks to members directly; concrete transports use
/// RESP over TCP or an in-process simulation.
#[async_trait]
pub trait AdminTransport: Send + Sync + 'static {
    async fn execute(&self, target: &NodeAddr, cmd: AdminCommand) -> Result<AdminReply>;

    /// Cluster-wide consistency repair (`--cluster fix`) anchored at `target`.
    async fn repair(&self, target: &NodeAddr) -> Result<()>;
}

/// Typed helpers layered over [`AdminTransport::execute`].
#[async_trait]
pub trait AdminExt: AdminTransport {
    async fn expect_ok(&self, target: &NodeAddr, cmd: AdminCommand) -> Result<()> {
        let name = cmd.name();
        match self.execute(target, cmd).await? {
            AdminReply::Ok => Ok(()),
            other => Err(ClusterError::protocol(
                target,
                format!("{name}: expected OK, got {other:?}"),
            )),
        }
    }

    async fn my_id(&self, target: &NodeAddr) -> Result<NodeId> {
        let id = self
            .execute(target, AdminCommand::ClusterMyId)
            .await?
            .into_text(target)?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ClusterError::protocol(target, "empty CLUSTER MYID reply"));
        }
        Ok(NodeId::new(id))
    }

    async fn cluster_nodes(&self, target: &NodeAddr) -> Result<Vec<ClusterNodeInfo>> {
        let raw = self
            .execute(target, AdminCommand::ClusterNodes)
            .await?
            .into_text(target)?;
        parse_cluster_nodes(&raw).map_err(|message| ClusterError::protocol(target, message))
    }
}

impl<T: AdminTransport + ?Sized> AdminExt for T {}

/// Configuration for [`RespAdmin`].
#[derive(Clone, Debug)]
pub struct RespAdminConfig {
    /// Network + reply deadline per command.
    pub command_timeout: Duration,
    /// `redis-cli` binary used for the cluster-wide fix.
    pub fix_tool: PathBuf,
    /// Deadline for the fix tool.
    pub fix_timeout: Duration,
}

impl Default for RespAdminConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            fix_tool: PathBuf::from("redis-cli"),
            fix_timeout: Duration::from_secs(120),
        }
    }
}

/// RESP2-over-TCP administrative transport.
#[derive(Clone, Debug, Default)]
pub struct RespAdmin {
    cfg: RespAdminConfig,
}

impl RespAdmin {
    pub fn new(cfg: RespAdminConfig) -> Self {
        Self { cfg }
    }

    async fn connect(&self, target: &NodeAddr) -> Result<Framed<TcpStream, Resp2>> {
        let socket = TcpStream::connect((target.host.as_str(), target.port)).await?;
        socket.set_nodelay(true).ok();
        Ok(Framed::new(socket, Resp2::default()))
    }

    async fn round_trip(&self, target: &NodeAddr, cmd: &AdminCommand) -> Result<AdminReply> {
        let mut conn = self.connect(target).await?;
        conn.send(cmd.to_frame())
            .await
            .map_err(|err| ClusterError::protocol(target, format!("send failed: {err}")))?;
        match conn.next().await {
            Some(Ok(frame)) => decode_reply(target, cmd, frame),
            Some(Err(err)) => Err(ClusterError::protocol(target, format!("recv failed: {err}"))),
            // SHUTDOWN closes the connection instead of replying.
            None if matches!(cmd, AdminCommand::Shutdown) => Ok(AdminReply::Ok),
            None => Err(ClusterError::protocol(target, "connection closed")),
        }
    }
}

#[async_trait]
impl AdminTransport for RespAdmin {
    async fn execute(&self, target: &NodeAddr, cmd: AdminCommand) -> Result<AdminReply> {
        match time::timeout(self.cfg.command_timeout, self.round_trip(target, &cmd)).await {
            Ok(res) => res,
            Err(_) => Err(ClusterError::CommandTimeout {
                command: cmd.name().to_string(),
                target: target.to_string(),
            }),
        }
    }

    async fn repair(&self, target: &NodeAddr) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.cfg.fix_tool);
        cmd.arg("--cluster")
            .arg("fix")
            .arg(target.to_string())
            .arg("--cluster-yes")
            .kill_on_drop(true);
        let output = match time::timeout(self.cfg.fix_timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ClusterError::CommandTimeout {
                    command: "--cluster fix".to_string(),
                    target: target.to_string(),
                })
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::protocol(
                target,
                format!("cluster fix exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(())
    }
}

fn decode_reply(target: &NodeAddr, cmd: &AdminCommand, frame: BytesFrame) -> Result<AdminReply> {
    match frame {
        BytesFrame::Error(err) => Err(ClusterError::protocol(
            target,
            format!("{}: {}", cmd.name(), err),
        )),
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(AdminReply::Ok),
        BytesFrame::SimpleString(s) if s.as_ref() == b"NOKEY" => Ok(AdminReply::NoKey),
        BytesFrame::SimpleString(s) | BytesFrame::BulkString(s) => {
            Ok(AdminReply::Text(String::from_utf8_lossy(&s).to_string()))
        }
        BytesFrame::Integer(i) => Ok(AdminReply::Integer(i)),
        BytesFrame::Array(items) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    BytesFrame::BulkString(key) | BytesFrame::SimpleString(key) => keys.push(key),
                    other => {
                        return Err(ClusterError::protocol(
                            target,
                            format!("{}: unexpected array item {other:?}", cmd.name()),
                        ))
                    }
                }
            }
            Ok(AdminReply::Keys(keys))
        }
        BytesFrame::Null => Ok(AdminReply::Text(String::new())),
    }
}

/// One line of `CLUSTER NODES` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNodeInfo {
    pub id: NodeId,
    /// `None` for members that have not learned their own address yet.
    pub addr: Option<NodeAddr>,
    pub flags: Vec<String>,
    pub connected: bool,
    /// Stable slot ranges (inclusive). Importing/migrating markers are skipped.
    pub slots: Vec<(Slot, Slot)>,
}

impl ClusterNodeInfo {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_failed(&self) -> bool {
        self.has_flag("fail") || self.has_flag("fail?")
    }

    pub fn owned_slots(&self) -> usize {
        self.slots
            .iter()
            .map(|(start, end)| (*end as usize) - (*start as usize) + 1)
            .sum()
    }
}

/// Parse `CLUSTER NODES` output.
///
/// Format per line: `<id> <ip:port@cport[,hostname]> <flags> <master> <ping-sent>
/// <pong-recv> <config-epoch> <link-state> <slot>...`.
pub fn parse_cluster_nodes(raw: &str) -> std::result::Result<Vec<ClusterNodeInfo>, String> {
    let mut out = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(format!("truncated CLUSTER NODES line: {line:?}"));
        }
        let addr_field = fields[1].split(',').next().unwrap_or(fields[1]);
        let addr = addr_field.parse::<NodeAddr>().ok();
        let flags = fields[2]
            .split(',')
            .filter(|f| !f.is_empty() && *f != "noflags")
            .map(str::to_string)
            .collect();
        let connected = fields[7] == "connected";
        let mut slots = Vec::new();
        for token in &fields[8..] {
            if token.starts_with('[') {
                continue;
            }
            let range = match token.split_once('-') {
                Some((start, end)) => (parse_slot(start, line)?, parse_slot(end, line)?),
                None => {
                    let slot = parse_slot(token, line)?;
                    (slot, slot)
                }
            };
            if range.0 > range.1 {
                return Err(format!("inverted slot range {token:?} in {line:?}"));
            }
            slots.push(range);
        }
        out.push(ClusterNodeInfo {
            id: NodeId::new(fields[0]),
            addr,
            flags,
            connected,
            slots,
        });
    }
    Ok(out)
}

fn parse_slot(raw: &str, line: &str) -> std::result::Result<Slot, String> {
    raw.parse::<Slot>()
        .map_err(|_| format!("invalid slot {raw:?} in {line:?}"))
}
