//! Wire protocol for the session hub.
//!
//! Frames are JSON text objects with a numeric `type` discriminator. The
//! discriminator values are part of the external contract and must never
//! change. Unknown discriminators are dropped by the caller; malformed
//! frames close the connection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{HubError, Result};

/// Message discriminators (wire-stable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Normal = 1,
    MatchRequest = 2,
    Move = 3,
    GameStart = 4,
    GameEnd = 5,
    JoinRoom = 6,
    CreateRoom = 7,
    Resign = 8,
    Error = 10,
    UndoRequest = 11,
    UndoResponse = 12,
    DrawRequest = 13,
    DrawResponse = 14,
    Chat = 15,
    Sync = 16,
    FriendRequest = 17,
    ChallengeInvite = 18,
    ChallengeCancel = 19,
    ChallengeAccept = 20,
    ChallengeReject = 21,
    ChallengeCreated = 22,
}

impl TryFrom<u8> for MessageType {
    type Error = HubError;

    fn try_from(value: u8) -> std::result::Result<Self, HubError> {
        match value {
            1 => Ok(Self::Normal),
            2 => Ok(Self::MatchRequest),
            3 => Ok(Self::Move),
            4 => Ok(Self::GameStart),
            5 => Ok(Self::GameEnd),
            6 => Ok(Self::JoinRoom),
            7 => Ok(Self::CreateRoom),
            8 => Ok(Self::Resign),
            10 => Ok(Self::Error),
            11 => Ok(Self::UndoRequest),
            12 => Ok(Self::UndoResponse),
            13 => Ok(Self::DrawRequest),
            14 => Ok(Self::DrawResponse),
            15 => Ok(Self::Chat),
            16 => Ok(Self::Sync),
            17 => Ok(Self::FriendRequest),
            18 => Ok(Self::ChallengeInvite),
            19 => Ok(Self::ChallengeCancel),
            20 => Ok(Self::ChallengeAccept),
            21 => Ok(Self::ChallengeReject),
            22 => Ok(Self::ChallengeCreated),
            other => Err(HubError::UnknownMessageType(other as u64)),
        }
    }
}

/// A board coordinate. Files run 0..=8, ranks 0..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub x: u8,
    pub y: u8,
}

impl Pos {
    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    pub fn in_bounds(&self) -> bool {
        self.x <= 8 && self.y <= 9
    }

    /// Reflect into the red frame: `(x, y) -> (8 - x, 9 - y)`.
    pub fn reflected(&self) -> Pos {
        Pos {
            x: 8 - self.x,
            y: 9 - self.y,
        }
    }
}

/// Player role inside a room. Doubles as the game-end `winner` encoding
/// (0 = none/draw, 1 = red, 2 = black).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Red,
    Black,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Red => Role::Black,
            Role::Black => Role::Red,
            Role::None => Role::None,
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Role::None => 0,
            Role::Red => 1,
            Role::Black => 2,
        }
    }

    pub fn from_wire(value: u8) -> Result<Role> {
        match value {
            0 => Ok(Role::None),
            1 => Ok(Role::Red),
            2 => Ok(Role::Black),
            other => Err(HubError::protocol(format!("invalid role value: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "",
            Role::Red => "red",
            Role::Black => "black",
        }
    }

    pub fn from_name(name: &str) -> Result<Role> {
        match name {
            "" => Ok(Role::None),
            "red" => Ok(Role::Red),
            "black" => Ok(Role::Black),
            other => Err(HubError::protocol(format!("invalid role name: {other}"))),
        }
    }
}

/// Opponent profile embedded in the game-start frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentProfile {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub total_games: u32,
    #[serde(default)]
    pub win_rate: f32,
}

/// A decoded wire frame, covering both directions of the protocol.
///
/// Bridge events (types 17..=22) originate from the HTTP layer and are
/// carried opaquely: the hub routes them without looking inside.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Normal { message: String },
    MatchRequest,
    Move { from: Pos, to: Pos },
    GameStart { role: Role, opponent: OpponentProfile },
    GameEnd { winner: Role },
    JoinRoom { room_id: u64 },
    CreateRoom,
    RoomCreated { room_id: u64 },
    Resign,
    Error { message: String },
    UndoRequest,
    UndoResponse { accepted: bool },
    DrawRequest,
    DrawResponse { accepted: bool },
    Chat { content: String, sender: String },
    Sync { history: Vec<Pos>, role: Role, current_turn: Role },
    Push { kind: MessageType, data: Map<String, Value> },
}

#[derive(Deserialize)]
struct MovePayload {
    from: Pos,
    to: Pos,
}

#[derive(Deserialize)]
struct StartPayload {
    role: String,
    opponent: OpponentProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    #[serde(default)]
    history: Vec<Pos>,
    #[serde(default)]
    role: String,
    #[serde(default)]
    current_turn: String,
}

impl Frame {
    /// Decode a text frame.
    ///
    /// Malformed JSON or structurally invalid payloads are protocol errors;
    /// a valid object with an unrecognised `type` yields
    /// [`HubError::UnknownMessageType`] so the caller can drop it without
    /// tearing the connection down.
    pub fn decode(text: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| HubError::protocol(format!("invalid frame: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| HubError::protocol("frame is not an object"))?;
        let raw = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| HubError::protocol("frame has no numeric type"))?;
        let kind = u8::try_from(raw)
            .map_err(|_| HubError::UnknownMessageType(raw))
            .and_then(MessageType::try_from)?;

        match kind {
            MessageType::Normal => Ok(Frame::Normal {
                message: field_str(obj, "message"),
            }),
            MessageType::MatchRequest => Ok(Frame::MatchRequest),
            MessageType::Move => {
                let payload: MovePayload = serde_json::from_value(value.clone())
                    .map_err(|e| HubError::protocol(format!("invalid move frame: {e}")))?;
                if !payload.from.in_bounds() || !payload.to.in_bounds() {
                    return Err(HubError::protocol("move coordinates out of bounds"));
                }
                Ok(Frame::Move {
                    from: payload.from,
                    to: payload.to,
                })
            }
            MessageType::GameStart => {
                let payload: StartPayload = serde_json::from_value(value.clone())
                    .map_err(|e| HubError::protocol(format!("invalid start frame: {e}")))?;
                Ok(Frame::GameStart {
                    role: Role::from_name(&payload.role)?,
                    opponent: payload.opponent,
                })
            }
            MessageType::GameEnd => {
                // A missing winner means none (draw).
                let winner = obj.get("winner").and_then(Value::as_u64).unwrap_or(0);
                let winner = u8::try_from(winner)
                    .map_err(|_| HubError::protocol("invalid winner value"))?;
                Ok(Frame::GameEnd {
                    winner: Role::from_wire(winner)?,
                })
            }
            MessageType::JoinRoom => {
                let room_id = obj
                    .get("roomId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| HubError::protocol("join frame has no roomId"))?;
                Ok(Frame::JoinRoom { room_id })
            }
            MessageType::CreateRoom => match obj.get("roomId").and_then(Value::as_u64) {
                Some(room_id) => Ok(Frame::RoomCreated { room_id }),
                None => Ok(Frame::CreateRoom),
            },
            MessageType::Resign => Ok(Frame::Resign),
            MessageType::Error => Ok(Frame::Error {
                message: field_str(obj, "message"),
            }),
            MessageType::UndoRequest => Ok(Frame::UndoRequest),
            MessageType::UndoResponse => Ok(Frame::UndoResponse {
                accepted: field_bool(obj, "accepted"),
            }),
            MessageType::DrawRequest => Ok(Frame::DrawRequest),
            MessageType::DrawResponse => Ok(Frame::DrawResponse {
                accepted: field_bool(obj, "accepted"),
            }),
            MessageType::Chat => Ok(Frame::Chat {
                content: field_str(obj, "content"),
                sender: field_str(obj, "sender"),
            }),
            MessageType::Sync => {
                let payload: SyncPayload = serde_json::from_value(value.clone())
                    .map_err(|e| HubError::protocol(format!("invalid sync frame: {e}")))?;
                Ok(Frame::Sync {
                    history: payload.history,
                    role: Role::from_name(&payload.role)?,
                    current_turn: Role::from_name(&payload.current_turn)?,
                })
            }
            MessageType::FriendRequest
            | MessageType::ChallengeInvite
            | MessageType::ChallengeCancel
            | MessageType::ChallengeAccept
            | MessageType::ChallengeReject
            | MessageType::ChallengeCreated => {
                let mut data = obj.clone();
                data.remove("type");
                Ok(Frame::Push { kind, data })
            }
        }
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> String {
        let value = match self {
            Frame::Normal { message } => json!({
                "type": MessageType::Normal as u8,
                "message": message,
            }),
            Frame::MatchRequest => json!({ "type": MessageType::MatchRequest as u8 }),
            Frame::Move { from, to } => json!({
                "type": MessageType::Move as u8,
                "from": from,
                "to": to,
            }),
            Frame::GameStart { role, opponent } => json!({
                "type": MessageType::GameStart as u8,
                "role": role.as_str(),
                "opponent": opponent,
            }),
            Frame::GameEnd { winner } => json!({
                "type": MessageType::GameEnd as u8,
                "winner": winner.as_wire(),
            }),
            Frame::JoinRoom { room_id } => json!({
                "type": MessageType::JoinRoom as u8,
                "roomId": room_id,
            }),
            Frame::CreateRoom => json!({ "type": MessageType::CreateRoom as u8 }),
            Frame::RoomCreated { room_id } => json!({
                "type": MessageType::CreateRoom as u8,
                "roomId": room_id,
            }),
            Frame::Resign => json!({ "type": MessageType::Resign as u8 }),
            Frame::Error { message } => json!({
                "type": MessageType::Error as u8,
                "message": message,
            }),
            Frame::UndoRequest => json!({ "type": MessageType::UndoRequest as u8 }),
            Frame::UndoResponse { accepted } => json!({
                "type": MessageType::UndoResponse as u8,
                "accepted": accepted,
            }),
            Frame::DrawRequest => json!({ "type": MessageType::DrawRequest as u8 }),
            Frame::DrawResponse { accepted } => json!({
                "type": MessageType::DrawResponse as u8,
                "accepted": accepted,
            }),
            Frame::Chat { content, sender } => json!({
                "type": MessageType::Chat as u8,
                "content": content,
                "sender": sender,
            }),
            Frame::Sync {
                history,
                role,
                current_turn,
            } => json!({
                "type": MessageType::Sync as u8,
                "history": history,
                "role": role.as_str(),
                "currentTurn": current_turn.as_str(),
            }),
            Frame::Push { kind, data } => {
                let mut map = data.clone();
                map.insert("type".to_string(), json!(*kind as u8));
                Value::Object(map)
            }
        };
        value.to_string()
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Normal { .. } => MessageType::Normal,
            Frame::MatchRequest => MessageType::MatchRequest,
            Frame::Move { .. } => MessageType::Move,
            Frame::GameStart { .. } => MessageType::GameStart,
            Frame::GameEnd { .. } => MessageType::GameEnd,
            Frame::JoinRoom { .. } => MessageType::JoinRoom,
            Frame::CreateRoom | Frame::RoomCreated { .. } => MessageType::CreateRoom,
            Frame::Resign => MessageType::Resign,
            Frame::Error { .. } => MessageType::Error,
            Frame::UndoRequest => MessageType::UndoRequest,
            Frame::UndoResponse { .. } => MessageType::UndoResponse,
            Frame::DrawRequest => MessageType::DrawRequest,
            Frame::DrawResponse { .. } => MessageType::DrawResponse,
            Frame::Chat { .. } => MessageType::Chat,
            Frame::Sync { .. } => MessageType::Sync,
            Frame::Push { kind, .. } => *kind,
        }
    }

    /// Critical frames must not be silently shed under backpressure; losing
    /// one forces a socket close so the client reconnects and resyncs.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Frame::Normal { .. } | Frame::Chat { .. } | Frame::Push { .. }
        )
    }
}

fn field_str(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn field_bool(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_frame_roundtrip() {
        let text = r#"{"type":3,"from":{"x":0,"y":3},"to":{"x":0,"y":4}}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(
            frame,
            Frame::Move {
                from: Pos::new(0, 3),
                to: Pos::new(0, 4),
            }
        );

        let reencoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(reencoded, frame);
    }

    #[test]
    fn test_move_bounds_checked() {
        let text = r#"{"type":3,"from":{"x":9,"y":3},"to":{"x":0,"y":4}}"#;
        assert!(matches!(
            Frame::decode(text),
            Err(HubError::Protocol { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let err = Frame::decode(r#"{"type":99}"#).unwrap_err();
        assert!(matches!(err, HubError::UnknownMessageType(99)));
        assert!(!err.is_state_error());
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(HubError::Protocol { .. })
        ));
        assert!(matches!(
            Frame::decode(r#"{"no_type":true}"#),
            Err(HubError::Protocol { .. })
        ));
    }

    #[test]
    fn test_game_end_winner_encoding() {
        let frame = Frame::GameEnd { winner: Role::Black };
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], 5);
        assert_eq!(value["winner"], 2);

        assert_eq!(
            Frame::decode(r#"{"type":5,"winner":0}"#).unwrap(),
            Frame::GameEnd { winner: Role::None }
        );
        // Missing winner defaults to none.
        assert_eq!(
            Frame::decode(r#"{"type":5}"#).unwrap(),
            Frame::GameEnd { winner: Role::None }
        );
    }

    #[test]
    fn test_empty_sync_shape() {
        let frame = Frame::Sync {
            history: vec![],
            role: Role::None,
            current_turn: Role::None,
        };
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], 16);
        assert_eq!(value["history"].as_array().unwrap().len(), 0);
        assert_eq!(value["role"], "");
        assert_eq!(value["currentTurn"], "");
    }

    #[test]
    fn test_sync_roundtrip() {
        let frame = Frame::Sync {
            history: vec![Pos::new(0, 3), Pos::new(0, 4)],
            role: Role::Red,
            current_turn: Role::Black,
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_game_start_carries_opponent() {
        let frame = Frame::GameStart {
            role: Role::Red,
            opponent: OpponentProfile {
                name: "bob".into(),
                avatar: "b.png".into(),
                exp: 120,
                total_games: 10,
                win_rate: 0.5,
            },
        };
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["role"], "red");
        assert_eq!(value["opponent"]["name"], "bob");
        assert_eq!(value["opponent"]["totalGames"], 10);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_room_created_carries_id() {
        assert_eq!(
            Frame::decode(r#"{"type":7}"#).unwrap(),
            Frame::CreateRoom
        );
        let frame = Frame::RoomCreated { room_id: 7 };
        assert_eq!(
            Frame::decode(&frame.encode()).unwrap(),
            Frame::RoomCreated { room_id: 7 }
        );
    }

    #[test]
    fn test_push_frame_is_opaque() {
        let text = r#"{"type":18,"challengeId":4,"senderName":"alice"}"#;
        let frame = Frame::decode(text).unwrap();
        match &frame {
            Frame::Push { kind, data } => {
                assert_eq!(*kind, MessageType::ChallengeInvite);
                assert_eq!(data["challengeId"], 4);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], 18);
        assert_eq!(value["senderName"], "alice");
    }

    #[test]
    fn test_criticality() {
        assert!(Frame::Move {
            from: Pos::new(0, 0),
            to: Pos::new(0, 1)
        }
        .is_critical());
        assert!(Frame::GameEnd { winner: Role::Red }.is_critical());
        assert!(!Frame::Normal {
            message: "hi".into()
        }
        .is_critical());
        assert!(!Frame::Chat {
            content: "hi".into(),
            sender: "a".into()
        }
        .is_critical());
    }

    #[test]
    fn test_reflection() {
        assert_eq!(Pos::new(6, 6).reflected(), Pos::new(2, 3));
        assert_eq!(Pos::new(0, 0).reflected(), Pos::new(8, 9));
        assert_eq!(Pos::new(8, 9).reflected(), Pos::new(0, 0));
    }
}
