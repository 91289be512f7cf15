//! Binary control messages injected into the "control" data channel.
//!
//! Every message starts with a one-byte type tag. Integers are little-endian
//! except where marked BE:
//! ```text
//! InjectKeycode (14 bytes)
//! [0]      type = 0
//! [1]      action
//! [2..6]   keycode (i32)
//! [6..10]  repeat (i32)
//! [10..14] meta_state (i32)
//!
//! InjectText (5 + n bytes)
//! [0]      type = 1
//! [1..5]   length (u32 BE)
//! [5..]    UTF-8 text
//!
//! InjectTouchEvent (32 bytes)
//! [0]      type = 2
//! [1]      action
//! [2..10]  pointer_id (i64 BE)
//! [10..14] x (i32)
//! [14..18] y (i32)
//! [18..20] video_width (u16)
//! [20..22] video_height (u16)
//! [22..24] pressure (u16, 0..=0xFFFF)
//! [24..28] action_button (i32)
//! [28..32] buttons (i32)
//!
//! SetClipboard (14 + n bytes)
//! [0]      type = 9
//! [1..9]   sequence (i64 BE, always 0)
//! [9]      paste flag (0/1)
//! [10..14] length (u32 BE)
//! [14..]   UTF-8 text
//! ```

pub const TYPE_INJECT_KEYCODE: u8 = 0;
pub const TYPE_INJECT_TEXT: u8 = 1;
pub const TYPE_INJECT_TOUCH_EVENT: u8 = 2;
pub const TYPE_SET_CLIPBOARD: u8 = 9;

pub const INJECT_KEYCODE_SIZE: usize = 14;
pub const INJECT_TOUCH_EVENT_SIZE: usize = 32;
const INJECT_TEXT_HEADER_SIZE: usize = 5;
const SET_CLIPBOARD_HEADER_SIZE: usize = 14;

pub const ACTION_DOWN: u8 = 0;
pub const ACTION_UP: u8 = 1;
pub const ACTION_MOVE: u8 = 2;
pub const ACTION_CANCEL: u8 = 3;

pub const BUTTON_PRIMARY: i32 = 1;
pub const BUTTON_SECONDARY: i32 = 2;
pub const BUTTON_TERTIARY: i32 = 4;

/// Pointer id used for the mouse, distinct from any touch identifier.
pub const POINTER_ID_MOUSE: i64 = -1;

/// Motion/key action carried in the second byte of keycode and touch messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Down,
    Up,
    Move,
    Cancel,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::Down => ACTION_DOWN,
            Action::Up => ACTION_UP,
            Action::Move => ACTION_MOVE,
            Action::Cancel => ACTION_CANCEL,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ControlError> {
        match code {
            ACTION_DOWN => Ok(Action::Down),
            ACTION_UP => Ok(Action::Up),
            ACTION_MOVE => Ok(Action::Move),
            ACTION_CANCEL => Ok(Action::Cancel),
            other => Err(ControlError::UnknownAction(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TouchEvent {
    pub action: Action,
    pub pointer_id: i64,
    pub x: i32,
    pub y: i32,
    pub video_width: u16,
    pub video_height: u16,
    pub pressure: u16,
    pub action_button: i32,
    pub buttons: i32,
}

impl TouchEvent {
    /// Build a touch event against the current video frame size.
    ///
    /// Returns `None` when the frame size is unknown (zero in either
    /// dimension); the device agent cannot scale such an event.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: Action,
        pointer_id: i64,
        x: f64,
        y: f64,
        video_size: (u32, u32),
        pressure: f64,
        action_button: i32,
        buttons: i32,
    ) -> Option<Self> {
        let (width, height) = video_size;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            action,
            pointer_id,
            x: x.round() as i32,
            y: y.round() as i32,
            video_width: width.min(u16::MAX as u32) as u16,
            video_height: height.min(u16::MAX as u32) as u16,
            pressure: pressure_to_u16(pressure),
            action_button,
            buttons,
        })
    }
}

/// Scale a pressure in [0.0, 1.0] to the 16-bit wire value.
/// Out-of-range and NaN inputs are clamped.
pub fn pressure_to_u16(pressure: f64) -> u16 {
    let p = if pressure.is_nan() {
        0.0
    } else {
        pressure.clamp(0.0, 1.0)
    };
    (p * f64::from(u16::MAX)).round() as u16
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    InjectKeycode {
        action: Action,
        keycode: i32,
        repeat: i32,
        meta_state: i32,
    },
    InjectText {
        text: String,
    },
    InjectTouchEvent(TouchEvent),
    SetClipboard {
        text: String,
        paste: bool,
    },
}

impl ControlMessage {
    pub fn keycode(action: Action, keycode: i32, meta_state: i32) -> Self {
        ControlMessage::InjectKeycode {
            action,
            keycode,
            repeat: 0,
            meta_state,
        }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            ControlMessage::InjectKeycode { .. } => TYPE_INJECT_KEYCODE,
            ControlMessage::InjectText { .. } => TYPE_INJECT_TEXT,
            ControlMessage::InjectTouchEvent(_) => TYPE_INJECT_TOUCH_EVENT,
            ControlMessage::SetClipboard { .. } => TYPE_SET_CLIPBOARD,
        }
    }

    /// Serialize to the exact byte layout expected by the device agent.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::InjectKeycode {
                action,
                keycode,
                repeat,
                meta_state,
            } => {
                let mut buf = Vec::with_capacity(INJECT_KEYCODE_SIZE);
                buf.push(TYPE_INJECT_KEYCODE);
                buf.push(action.code());
                buf.extend_from_slice(&keycode.to_le_bytes());
                buf.extend_from_slice(&repeat.to_le_bytes());
                buf.extend_from_slice(&meta_state.to_le_bytes());
                buf
            }
            ControlMessage::InjectText { text } => {
                let bytes = text.as_bytes();
                let mut buf = Vec::with_capacity(INJECT_TEXT_HEADER_SIZE + bytes.len());
                buf.push(TYPE_INJECT_TEXT);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
                buf
            }
            ControlMessage::InjectTouchEvent(touch) => {
                let mut buf = Vec::with_capacity(INJECT_TOUCH_EVENT_SIZE);
                buf.push(TYPE_INJECT_TOUCH_EVENT);
                buf.push(touch.action.code());
                buf.extend_from_slice(&touch.pointer_id.to_be_bytes());
                buf.extend_from_slice(&touch.x.to_le_bytes());
                buf.extend_from_slice(&touch.y.to_le_bytes());
                buf.extend_from_slice(&touch.video_width.to_le_bytes());
                buf.extend_from_slice(&touch.video_height.to_le_bytes());
                buf.extend_from_slice(&touch.pressure.to_le_bytes());
                buf.extend_from_slice(&touch.action_button.to_le_bytes());
                buf.extend_from_slice(&touch.buttons.to_le_bytes());
                buf
            }
            ControlMessage::SetClipboard { text, paste } => {
                let bytes = text.as_bytes();
                let mut buf = Vec::with_capacity(SET_CLIPBOARD_HEADER_SIZE + bytes.len());
                buf.push(TYPE_SET_CLIPBOARD);
                buf.extend_from_slice(&0i64.to_be_bytes());
                buf.push(u8::from(*paste));
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
                buf
            }
        }
    }

    /// Parse a buffer produced by [`ControlMessage::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let Some(&tag) = buf.first() else {
            return Err(ControlError::TooShort {
                expected: 1,
                actual: 0,
            });
        };
        match tag {
            TYPE_INJECT_KEYCODE => {
                require_len(buf, INJECT_KEYCODE_SIZE)?;
                Ok(ControlMessage::InjectKeycode {
                    action: Action::from_code(buf[1])?,
                    keycode: read_i32_le(buf, 2),
                    repeat: read_i32_le(buf, 6),
                    meta_state: read_i32_le(buf, 10),
                })
            }
            TYPE_INJECT_TEXT => {
                let text = read_text(buf, 1)?;
                Ok(ControlMessage::InjectText { text })
            }
            TYPE_INJECT_TOUCH_EVENT => {
                require_len(buf, INJECT_TOUCH_EVENT_SIZE)?;
                let mut pointer = [0u8; 8];
                pointer.copy_from_slice(&buf[2..10]);
                Ok(ControlMessage::InjectTouchEvent(TouchEvent {
                    action: Action::from_code(buf[1])?,
                    pointer_id: i64::from_be_bytes(pointer),
                    x: read_i32_le(buf, 10),
                    y: read_i32_le(buf, 14),
                    video_width: u16::from_le_bytes([buf[18], buf[19]]),
                    video_height: u16::from_le_bytes([buf[20], buf[21]]),
                    pressure: u16::from_le_bytes([buf[22], buf[23]]),
                    action_button: read_i32_le(buf, 24),
                    buttons: read_i32_le(buf, 28),
                }))
            }
            TYPE_SET_CLIPBOARD => {
                require_len(buf, SET_CLIPBOARD_HEADER_SIZE)?;
                let paste = match buf[9] {
                    0 => false,
                    1 => true,
                    other => return Err(ControlError::BadPasteFlag(other)),
                };
                let text = read_text(buf, 10)?;
                Ok(ControlMessage::SetClipboard { text, paste })
            }
            other => Err(ControlError::UnknownType(other)),
        }
    }
}

fn require_len(buf: &[u8], expected: usize) -> Result<(), ControlError> {
    if buf.len() < expected {
        return Err(ControlError::TooShort {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Read a u32 BE length prefix at `offset` followed by that many UTF-8 bytes.
fn read_text(buf: &[u8], offset: usize) -> Result<String, ControlError> {
    require_len(buf, offset + 4)?;
    let len = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        as usize;
    let start = offset + 4;
    if buf.len() < start + len {
        return Err(ControlError::IncompleteText {
            expected: len,
            actual: buf.len() - start,
        });
    }
    String::from_utf8(buf[start..start + len].to_vec()).map_err(|_| ControlError::InvalidUtf8)
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("buffer too short: {actual} bytes (need at least {expected})")]
    TooShort { expected: usize, actual: usize },
    #[error("unknown control message type: {0}")]
    UnknownType(u8),
    #[error("unknown action code: {0}")]
    UnknownAction(u8),
    #[error("invalid paste flag: {0}")]
    BadPasteFlag(u8),
    #[error("incomplete text: expected {expected} bytes, got {actual}")]
    IncompleteText { expected: usize, actual: usize },
    #[error("text is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycode_layout_is_14_bytes() {
        let buf = ControlMessage::keycode(Action::Down, 29, 0).encode();
        assert_eq!(buf.len(), INJECT_KEYCODE_SIZE);
        assert_eq!(buf, vec![0, 0, 29, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn keycode_fields_little_endian() {
        let msg = ControlMessage::InjectKeycode {
            action: Action::Up,
            keycode: 0x0102_0304,
            repeat: 2,
            meta_state: 4096,
        };
        let buf = msg.encode();
        assert_eq!(buf[1], ACTION_UP);
        assert_eq!(&buf[2..6], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[6..10], &2i32.to_le_bytes());
        assert_eq!(&buf[10..14], &4096i32.to_le_bytes());
        assert_eq!(ControlMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn keycode_roundtrip_across_keycode_space() {
        for keycode in [0, 3, 4, 29, 54, 66, 67, 82, 112, 142, 160, 276] {
            for action in [Action::Down, Action::Up] {
                let msg = ControlMessage::InjectKeycode {
                    action,
                    keycode,
                    repeat: 0,
                    meta_state: 1,
                };
                assert_eq!(ControlMessage::decode(&msg.encode()).unwrap(), msg);
            }
        }
    }

    #[test]
    fn inject_text_length_is_big_endian() {
        let buf = ControlMessage::InjectText {
            text: "hi".to_string(),
        }
        .encode();
        assert_eq!(buf, vec![1, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn inject_text_length_counts_utf8_bytes() {
        let text = "h\u{e9}llo \u{4e16}\u{754c} \u{1f680}";
        let message = ControlMessage::InjectText {
            text: text.to_string(),
        };
        let buf = message.encode();
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, text.len());
        assert_ne!(len, text.chars().count());
        assert_eq!(&buf[5..], text.as_bytes());
        assert_eq!(ControlMessage::decode(&buf).unwrap(), message);
    }

    #[test]
    fn touch_layout_is_32_bytes() {
        let touch = TouchEvent::new(
            Action::Down,
            POINTER_ID_MOUSE,
            100.4,
            200.6,
            (1080, 1920),
            1.0,
            BUTTON_PRIMARY,
            BUTTON_PRIMARY,
        )
        .unwrap();
        let buf = ControlMessage::InjectTouchEvent(touch.clone()).encode();
        assert_eq!(buf.len(), INJECT_TOUCH_EVENT_SIZE);
        assert_eq!(buf[0], TYPE_INJECT_TOUCH_EVENT);
        assert_eq!(buf[1], ACTION_DOWN);
        assert_eq!(&buf[2..10], &(-1i64).to_be_bytes());
        assert_eq!(&buf[10..14], &100i32.to_le_bytes());
        assert_eq!(&buf[14..18], &201i32.to_le_bytes());
        assert_eq!(&buf[18..20], &1080u16.to_le_bytes());
        assert_eq!(&buf[20..22], &1920u16.to_le_bytes());
        assert_eq!(&buf[22..24], &[0xFF, 0xFF]);
        assert_eq!(&buf[24..28], &1i32.to_le_bytes());
        assert_eq!(&buf[28..32], &1i32.to_le_bytes());

        match ControlMessage::decode(&buf).unwrap() {
            ControlMessage::InjectTouchEvent(parsed) => assert_eq!(parsed, touch),
            other => panic!("expected touch event, got {other:?}"),
        }
    }

    #[test]
    fn touch_pointer_id_big_endian() {
        let touch = TouchEvent::new(Action::Move, 7, 0.0, 0.0, (10, 10), 0.5, 0, 0).unwrap();
        let buf = ControlMessage::InjectTouchEvent(touch).encode();
        assert_eq!(&buf[2..10], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn touch_without_video_size_yields_nothing() {
        assert!(TouchEvent::new(Action::Down, 0, 1.0, 1.0, (0, 1920), 1.0, 0, 0).is_none());
        assert!(TouchEvent::new(Action::Down, 0, 1.0, 1.0, (1080, 0), 1.0, 0, 0).is_none());
        assert!(TouchEvent::new(Action::Down, 0, 1.0, 1.0, (0, 0), 1.0, 0, 0).is_none());
    }

    #[test]
    fn pressure_is_monotonic_and_saturates() {
        let mut last = 0u16;
        for step in 0..=100 {
            let p = pressure_to_u16(step as f64 / 100.0);
            assert!(p >= last, "pressure decreased at step {step}");
            last = p;
        }
        assert_eq!(pressure_to_u16(0.0), 0);
        assert_eq!(pressure_to_u16(1.0), 0xFFFF);
        assert_eq!(pressure_to_u16(1.5), 0xFFFF);
        assert_eq!(pressure_to_u16(-0.2), 0);
        assert_eq!(pressure_to_u16(f64::NAN), 0);
    }

    #[test]
    fn clipboard_paste_flag() {
        let pasted = ControlMessage::SetClipboard {
            text: "x".to_string(),
            paste: true,
        }
        .encode();
        assert_eq!(pasted[9], 1);
        let copied = ControlMessage::SetClipboard {
            text: "x".to_string(),
            paste: false,
        }
        .encode();
        assert_eq!(copied[9], 0);
    }

    #[test]
    fn clipboard_roundtrip_empty_and_multibyte() {
        for text in ["", "hello", "héllo wörld", "日本語テキスト", "emoji 🚀"] {
            let msg = ControlMessage::SetClipboard {
                text: text.to_string(),
                paste: true,
            };
            let buf = msg.encode();
            assert_eq!(buf.len(), 14 + text.len());
            assert_eq!(buf[0], TYPE_SET_CLIPBOARD);
            assert_eq!(&buf[1..9], &[0u8; 8]);
            assert_eq!(&buf[10..14], &(text.len() as u32).to_be_bytes());
            assert_eq!(&buf[14..], text.as_bytes());
            assert_eq!(ControlMessage::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn decode_empty_buffer() {
        match ControlMessage::decode(&[]) {
            Err(ControlError::TooShort {
                expected: 1,
                actual: 0,
            }) => {}
            other => panic!("expected TooShort, got {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_type() {
        match ControlMessage::decode(&[42, 0, 0]) {
            Err(ControlError::UnknownType(42)) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn decode_truncated_keycode() {
        let buf = ControlMessage::keycode(Action::Down, 29, 0).encode();
        match ControlMessage::decode(&buf[..10]) {
            Err(ControlError::TooShort {
                expected: 14,
                actual: 10,
            }) => {}
            other => panic!("expected TooShort, got {other:?}"),
        }
    }

    #[test]
    fn decode_incomplete_text() {
        let mut buf = ControlMessage::InjectText {
            text: "hello".to_string(),
        }
        .encode();
        buf.truncate(7);
        match ControlMessage::decode(&buf) {
            Err(ControlError::IncompleteText {
                expected: 5,
                actual: 2,
            }) => {}
            other => panic!("expected IncompleteText, got {other:?}"),
        }
    }
}
