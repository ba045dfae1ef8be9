pub mod message;
pub mod playlist;
pub mod room;
pub mod ws;

pub use message::{MessageKind, RoomMessage, SongCandidate};
pub use playlist::{AddSongRequest, PlaybackState, RoomPlaylistItem, SongSource};
pub use room::{
    CreateRoomRequest, DisbandRoomRequest, GrantControlRequest, JoinRoomRequest,
    LeaveRoomRequest, MemberMode, OnlineMember, Room, RoomMember, RoomRole,
    SwitchModeRequest, TransferOwnerRequest,
};
pub use ws::{RoomWsMessageType, WsFrame};
