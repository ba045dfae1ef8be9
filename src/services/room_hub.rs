//! Room hub: the in-process fan-out plane.
//!
//! One dedicated task owns the `room -> clients` map; every other task talks
//! to it through commands, so the map itself is never shared. Each client
//! holds a bounded outbound channel. Delivery never blocks the hub: a full
//! channel means the reader is stuck, and the client is dropped on the spot
//! so memory stays bounded under any reader behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::ws::{JoinLeaveData, MemberListData};
use crate::models::{MemberMode, OnlineMember, RoomRole, RoomWsMessageType, WsFrame};
use crate::services::room_cache::EventEnvelope;

/// Outbound frames buffered per client before it is considered dead.
pub const CLIENT_BUFFER: usize = 256;

#[derive(Debug)]
enum HubCommand {
    Register {
        room_id: String,
        member: OnlineMember,
        conn_id: u64,
        out: mpsc::Sender<WsFrame>,
    },
    Unregister {
        room_id: String,
        user_id: i64,
        conn_id: u64,
    },
    Broadcast {
        room_id: String,
        frame: WsFrame,
        except: Option<i64>,
        /// When set, deliver to this user only.
        only: Option<i64>,
        mode_filter: Option<MemberMode>,
    },
    Update {
        room_id: String,
        user_id: i64,
        role: Option<RoomRole>,
        mode: Option<MemberMode>,
        can_control: Option<bool>,
    },
    Disband {
        room_id: String,
        frame: WsFrame,
    },
    /// Remove one member's connection (any conn id), optionally delivering a
    /// final frame first. Used when a member leaves the room for good; the
    /// departure announcement is the caller's responsibility.
    Kick {
        room_id: String,
        user_id: i64,
        frame: Option<WsFrame>,
    },
}

struct ClientSlot {
    member: OnlineMember,
    conn_id: u64,
    out: mpsc::Sender<WsFrame>,
}

pub struct RoomHub {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_conn: AtomicU64,
}

impl RoomHub {
    /// Creates the hub and spawns its event loop.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            tx,
            next_conn: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id; a reconnect replaces the previous
    /// registration and its stale unregister becomes a no-op.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(
        &self,
        room_id: &str,
        member: OnlineMember,
        conn_id: u64,
        out: mpsc::Sender<WsFrame>,
    ) {
        let _ = self.tx.send(HubCommand::Register {
            room_id: room_id.to_string(),
            member,
            conn_id,
            out,
        });
    }

    pub fn unregister(&self, room_id: &str, user_id: i64, conn_id: u64) {
        let _ = self.tx.send(HubCommand::Unregister {
            room_id: room_id.to_string(),
            user_id,
            conn_id,
        });
    }

    pub fn broadcast(
        &self,
        room_id: &str,
        frame: WsFrame,
        except: Option<i64>,
        mode_filter: Option<MemberMode>,
    ) {
        let _ = self.tx.send(HubCommand::Broadcast {
            room_id: room_id.to_string(),
            frame,
            except,
            only: None,
            mode_filter,
        });
    }

    /// Deliver a frame to a single connected member.
    pub fn send_to(&self, room_id: &str, user_id: i64, frame: WsFrame) {
        let _ = self.tx.send(HubCommand::Broadcast {
            room_id: room_id.to_string(),
            frame,
            except: None,
            only: Some(user_id),
            mode_filter: None,
        });
    }

    /// Keep the hub's roster in sync with role/mode/control changes so
    /// mode-filtered broadcasts and snapshots stay accurate.
    pub fn update_client(
        &self,
        room_id: &str,
        user_id: i64,
        role: Option<RoomRole>,
        mode: Option<MemberMode>,
        can_control: Option<bool>,
    ) {
        let _ = self.tx.send(HubCommand::Update {
            room_id: room_id.to_string(),
            user_id,
            role,
            mode,
            can_control,
        });
    }

    /// Deliver a final frame to every client in the room, then drain them all.
    pub fn disband(&self, room_id: &str, frame: WsFrame) {
        let _ = self.tx.send(HubCommand::Disband {
            room_id: room_id.to_string(),
            frame,
        });
    }

    pub fn kick(&self, room_id: &str, user_id: i64, frame: Option<WsFrame>) {
        let _ = self.tx.send(HubCommand::Kick {
            room_id: room_id.to_string(),
            user_id,
            frame,
        });
    }

    /// Bridge cache pub/sub envelopes (from other instances) into local
    /// broadcasts.
    pub fn forward_envelopes(&self, mut rx: mpsc::UnboundedReceiver<EventEnvelope>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let _ = tx.send(HubCommand::Broadcast {
                    room_id: env.room_id,
                    frame: env.frame,
                    except: env.except,
                    only: env.only,
                    mode_filter: env.mode_filter,
                });
            }
        });
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut rooms: HashMap<String, HashMap<i64, ClientSlot>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register {
                room_id,
                member,
                conn_id,
                out,
            } => {
                let clients = rooms.entry(room_id.clone()).or_default();
                let user_id = member.user_id;
                let username = member.username.clone();

                // A reconnect replaces the previous connection; dropping the
                // old sender lets its write pump wind down.
                if clients.remove(&user_id).is_some() {
                    debug!(%room_id, user_id, "replaced existing connection");
                }
                clients.insert(
                    user_id,
                    ClientSlot {
                        member,
                        conn_id,
                        out,
                    },
                );

                // Snapshot of the online roster to the newcomer only.
                let snapshot = WsFrame::server(
                    RoomWsMessageType::MemberList,
                    &room_id,
                    &MemberListData {
                        members: clients.values().map(|c| c.member.clone()).collect(),
                    },
                );
                if let Some(client) = clients.get(&user_id) {
                    let _ = client.out.try_send(snapshot);
                }

                let join = WsFrame::server(
                    RoomWsMessageType::Join,
                    &room_id,
                    &JoinLeaveData { user_id, username },
                );
                deliver(&mut rooms, &room_id, join, Some(user_id), None, None);
                info!(%room_id, user_id, "client registered");
            }

            HubCommand::Unregister {
                room_id,
                user_id,
                conn_id,
            } => {
                let removed = match rooms.get_mut(&room_id) {
                    Some(clients) => match clients.get(&user_id) {
                        // Ignore unregisters from a connection that was
                        // already replaced.
                        Some(slot) if slot.conn_id == conn_id => clients.remove(&user_id),
                        _ => None,
                    },
                    None => None,
                };

                if let Some(slot) = removed {
                    announce_leave(&mut rooms, &room_id, &slot.member);
                    info!(%room_id, user_id, "client unregistered");
                }
                prune_room(&mut rooms, &room_id);
            }

            HubCommand::Broadcast {
                room_id,
                frame,
                except,
                only,
                mode_filter,
            } => {
                deliver(&mut rooms, &room_id, frame, except, only, mode_filter);
            }

            HubCommand::Update {
                room_id,
                user_id,
                role,
                mode,
                can_control,
            } => {
                if let Some(slot) = rooms.get_mut(&room_id).and_then(|c| c.get_mut(&user_id)) {
                    if let Some(role) = role {
                        slot.member.role = role;
                    }
                    if let Some(mode) = mode {
                        slot.member.mode = mode;
                    }
                    if let Some(can_control) = can_control {
                        slot.member.can_control = can_control;
                    }
                }
            }

            HubCommand::Disband { room_id, frame } => {
                if let Some(clients) = rooms.remove(&room_id) {
                    for client in clients.values() {
                        let _ = client.out.try_send(frame.clone());
                    }
                    info!(%room_id, clients = clients.len(), "room disbanded, connections drained");
                }
            }

            HubCommand::Kick {
                room_id,
                user_id,
                frame,
            } => {
                if let Some(slot) = rooms.get_mut(&room_id).and_then(|c| c.remove(&user_id)) {
                    if let Some(frame) = frame {
                        let _ = slot.out.try_send(frame);
                    }
                }
                prune_room(&mut rooms, &room_id);
            }
        }
    }
}

/// Fan a frame out to a room. A full outbound channel means a stuck reader:
/// the client is removed immediately and its departure announced, which may
/// in turn surface more stuck readers, so the drop loop runs to a fixpoint.
fn deliver(
    rooms: &mut HashMap<String, HashMap<i64, ClientSlot>>,
    room_id: &str,
    frame: WsFrame,
    except: Option<i64>,
    only: Option<i64>,
    mode_filter: Option<MemberMode>,
) {
    let mut dead: Vec<OnlineMember> = Vec::new();

    if let Some(clients) = rooms.get_mut(room_id) {
        for client in clients.values() {
            if Some(client.member.user_id) == except {
                continue;
            }
            if let Some(target) = only {
                if client.member.user_id != target {
                    continue;
                }
            }
            if let Some(mode) = mode_filter {
                if client.member.mode != mode {
                    continue;
                }
            }
            match client.out.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        room_id,
                        user_id = client.member.user_id,
                        "outbound buffer overflow, dropping client"
                    );
                    dead.push(client.member.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(client.member.clone());
                }
            }
        }
        for member in &dead {
            clients.remove(&member.user_id);
        }
    }

    for member in dead {
        announce_leave(rooms, room_id, &member);
    }
    prune_room(rooms, room_id);
}

fn announce_leave(
    rooms: &mut HashMap<String, HashMap<i64, ClientSlot>>,
    room_id: &str,
    member: &OnlineMember,
) {
    let leave = WsFrame::server(
        RoomWsMessageType::Leave,
        room_id,
        &JoinLeaveData {
            user_id: member.user_id,
            username: member.username.clone(),
        },
    );
    deliver(rooms, room_id, leave, None, None, None);
}

fn prune_room(rooms: &mut HashMap<String, HashMap<i64, ClientSlot>>, room_id: &str) {
    if rooms.get(room_id).is_some_and(|c| c.is_empty()) {
        rooms.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn member(user_id: i64, mode: MemberMode) -> OnlineMember {
        OnlineMember {
            user_id,
            username: format!("user{user_id}"),
            role: if user_id == 1 {
                RoomRole::Owner
            } else {
                RoomRole::Member
            },
            mode,
            can_control: false,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<WsFrame>) -> WsFrame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within 1s")
            .expect("channel open")
    }

    #[tokio::test]
    async fn register_sends_snapshot_and_join() {
        let hub = RoomHub::new();
        let (a_tx, mut a_rx) = mpsc::channel(CLIENT_BUFFER);
        let (b_tx, mut b_rx) = mpsc::channel(CLIENT_BUFFER);

        hub.register("r1", member(1, MemberMode::Chat), hub.next_conn_id(), a_tx);
        let snapshot = recv(&mut a_rx).await;
        assert_eq!(snapshot.kind, RoomWsMessageType::MemberList);

        hub.register("r1", member(2, MemberMode::Chat), hub.next_conn_id(), b_tx);
        // B gets the two-member snapshot, A gets B's join.
        let b_snapshot = recv(&mut b_rx).await;
        let data: MemberListData = b_snapshot.payload().unwrap();
        assert_eq!(data.members.len(), 2);

        let join = recv(&mut a_rx).await;
        assert_eq!(join.kind, RoomWsMessageType::Join);
        let join_data: JoinLeaveData = join.payload().unwrap();
        assert_eq!(join_data.user_id, 2);
    }

    #[tokio::test]
    async fn broadcast_honors_except_and_mode_filter() {
        let hub = RoomHub::new();
        let (a_tx, mut a_rx) = mpsc::channel(CLIENT_BUFFER);
        let (b_tx, mut b_rx) = mpsc::channel(CLIENT_BUFFER);
        let (c_tx, mut c_rx) = mpsc::channel(CLIENT_BUFFER);

        hub.register("r1", member(1, MemberMode::Listen), hub.next_conn_id(), a_tx);
        hub.register("r1", member(2, MemberMode::Listen), hub.next_conn_id(), b_tx);
        hub.register("r1", member(3, MemberMode::Chat), hub.next_conn_id(), c_tx);

        // Drain registration chatter.
        recv(&mut a_rx).await; // snapshot
        recv(&mut a_rx).await; // join 2
        recv(&mut a_rx).await; // join 3
        recv(&mut b_rx).await; // snapshot
        recv(&mut b_rx).await; // join 3
        recv(&mut c_rx).await; // snapshot

        let frame = WsFrame::server(
            RoomWsMessageType::MasterSync,
            "r1",
            &serde_json::json!({"position": 1.0}),
        );
        hub.broadcast("r1", frame, Some(1), Some(MemberMode::Listen));

        let got = recv(&mut b_rx).await;
        assert_eq!(got.kind, RoomWsMessageType::MasterSync);

        // Neither the excluded master nor the chat-mode member sees it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_reader_is_dropped_and_leave_announced() {
        let hub = RoomHub::new();
        let (healthy_tx, mut healthy_rx) = mpsc::channel(CLIENT_BUFFER);
        // Capacity 1 and never drained: the second broadcast overflows.
        let (stuck_tx, stuck_rx) = mpsc::channel(1);

        hub.register("r1", member(1, MemberMode::Chat), hub.next_conn_id(), healthy_tx);
        hub.register("r1", member(2, MemberMode::Chat), hub.next_conn_id(), stuck_tx);
        recv(&mut healthy_rx).await; // snapshot
        recv(&mut healthy_rx).await; // join 2

        for i in 0..3 {
            let frame = WsFrame::server(
                RoomWsMessageType::Chat,
                "r1",
                &serde_json::json!({"content": format!("msg {i}")}),
            );
            hub.broadcast("r1", frame, None, None);
        }

        // Healthy client sees all three chats plus the stuck client's leave.
        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(recv(&mut healthy_rx).await.kind);
        }
        assert_eq!(kinds.iter().filter(|k| **k == RoomWsMessageType::Chat).count(), 3);
        assert!(kinds.contains(&RoomWsMessageType::Leave));

        drop(stuck_rx);
    }

    #[tokio::test]
    async fn mode_updates_apply_to_filtered_broadcasts() {
        let hub = RoomHub::new();
        let (tx, mut rx) = mpsc::channel(CLIENT_BUFFER);

        hub.register("r1", member(2, MemberMode::Chat), hub.next_conn_id(), tx);
        recv(&mut rx).await; // snapshot

        let frame = WsFrame::server(
            RoomWsMessageType::MasterSync,
            "r1",
            &serde_json::json!({"position": 1.0}),
        );
        hub.broadcast("r1", frame.clone(), None, Some(MemberMode::Listen));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        // After switching to listen mode the client is a sync target.
        hub.update_client("r1", 2, None, Some(MemberMode::Listen), None);
        hub.broadcast("r1", frame, None, Some(MemberMode::Listen));
        assert_eq!(recv(&mut rx).await.kind, RoomWsMessageType::MasterSync);
    }

    #[tokio::test]
    async fn stale_unregister_is_ignored_after_reconnect() {
        let hub = RoomHub::new();
        let (old_tx, _old_rx) = mpsc::channel(CLIENT_BUFFER);
        let (new_tx, mut new_rx) = mpsc::channel(CLIENT_BUFFER);

        let old_conn = hub.next_conn_id();
        hub.register("r1", member(1, MemberMode::Chat), old_conn, old_tx);
        let new_conn = hub.next_conn_id();
        hub.register("r1", member(1, MemberMode::Chat), new_conn, new_tx);
        recv(&mut new_rx).await; // snapshot

        // The old connection's teardown must not evict the new one.
        hub.unregister("r1", 1, old_conn);

        let frame = WsFrame::server(
            RoomWsMessageType::Chat,
            "r1",
            &serde_json::json!({"content": "still here"}),
        );
        hub.broadcast("r1", frame, None, None);
        assert_eq!(recv(&mut new_rx).await.kind, RoomWsMessageType::Chat);
    }

    #[tokio::test]
    async fn disband_delivers_final_frame_to_all() {
        let hub = RoomHub::new();
        let (a_tx, mut a_rx) = mpsc::channel(CLIENT_BUFFER);
        let (b_tx, mut b_rx) = mpsc::channel(CLIENT_BUFFER);

        hub.register("r1", member(1, MemberMode::Chat), hub.next_conn_id(), a_tx);
        hub.register("r1", member(2, MemberMode::Chat), hub.next_conn_id(), b_tx);
        recv(&mut a_rx).await;
        recv(&mut a_rx).await;
        recv(&mut b_rx).await;

        let frame = WsFrame::server(RoomWsMessageType::RoomDisband, "r1", &serde_json::json!({}));
        hub.disband("r1", frame);

        assert_eq!(recv(&mut a_rx).await.kind, RoomWsMessageType::RoomDisband);
        assert_eq!(recv(&mut b_rx).await.kind, RoomWsMessageType::RoomDisband);
        // Senders were dropped with the room: channels close after the frame.
        assert!(a_rx.recv().await.is_none());
        assert!(b_rx.recv().await.is_none());
    }
}
