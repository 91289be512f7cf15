//! Android `KeyEvent` keycodes and the physical-key lookup table.
//!
//! Physical keys are identified by their layout-independent code names
//! (`KeyA`, `Digit1`, `ArrowUp`, `ShiftLeft`, ...), so the same key maps to
//! the same Android keycode regardless of the host keyboard layout.

use crate::control::{Action, ControlMessage};
use serde::{Deserialize, Serialize};

pub const META_NONE: i32 = 0;
pub const META_SHIFT_ON: i32 = 1;
pub const META_ALT_ON: i32 = 2;
/// META_CTRL_LEFT_ON | META_CTRL_RIGHT_ON
pub const META_CTRL_ON: i32 = 4096;
/// META_META_LEFT_ON | META_META_RIGHT_ON
pub const META_META_ON: i32 = 65536;

pub const KEYCODE_HOME: i32 = 3;
pub const KEYCODE_BACK: i32 = 4;
pub const KEYCODE_0: i32 = 7;
pub const KEYCODE_DPAD_UP: i32 = 19;
pub const KEYCODE_DPAD_DOWN: i32 = 20;
pub const KEYCODE_DPAD_LEFT: i32 = 21;
pub const KEYCODE_DPAD_RIGHT: i32 = 22;
pub const KEYCODE_VOLUME_UP: i32 = 24;
pub const KEYCODE_VOLUME_DOWN: i32 = 25;
pub const KEYCODE_POWER: i32 = 26;
pub const KEYCODE_A: i32 = 29;
pub const KEYCODE_COMMA: i32 = 55;
pub const KEYCODE_PERIOD: i32 = 56;
pub const KEYCODE_ALT_LEFT: i32 = 57;
pub const KEYCODE_ALT_RIGHT: i32 = 58;
pub const KEYCODE_SHIFT_LEFT: i32 = 59;
pub const KEYCODE_SHIFT_RIGHT: i32 = 60;
pub const KEYCODE_TAB: i32 = 61;
pub const KEYCODE_SPACE: i32 = 62;
pub const KEYCODE_ENTER: i32 = 66;
pub const KEYCODE_DEL: i32 = 67;
pub const KEYCODE_GRAVE: i32 = 68;
pub const KEYCODE_MINUS: i32 = 69;
pub const KEYCODE_EQUALS: i32 = 70;
pub const KEYCODE_LEFT_BRACKET: i32 = 71;
pub const KEYCODE_RIGHT_BRACKET: i32 = 72;
pub const KEYCODE_BACKSLASH: i32 = 73;
pub const KEYCODE_SEMICOLON: i32 = 74;
pub const KEYCODE_APOSTROPHE: i32 = 75;
pub const KEYCODE_SLASH: i32 = 76;
pub const KEYCODE_MENU: i32 = 82;
pub const KEYCODE_PAGE_UP: i32 = 92;
pub const KEYCODE_PAGE_DOWN: i32 = 93;
pub const KEYCODE_ESCAPE: i32 = 111;
pub const KEYCODE_FORWARD_DEL: i32 = 112;
pub const KEYCODE_CTRL_LEFT: i32 = 113;
pub const KEYCODE_CTRL_RIGHT: i32 = 114;
pub const KEYCODE_META_LEFT: i32 = 117;
pub const KEYCODE_META_RIGHT: i32 = 118;
pub const KEYCODE_MOVE_HOME: i32 = 122;
pub const KEYCODE_MOVE_END: i32 = 123;
pub const KEYCODE_INSERT: i32 = 124;
pub const KEYCODE_F1: i32 = 131;
pub const KEYCODE_NUMPAD_0: i32 = 144;
pub const KEYCODE_NUMPAD_DIVIDE: i32 = 154;
pub const KEYCODE_NUMPAD_MULTIPLY: i32 = 155;
pub const KEYCODE_NUMPAD_SUBTRACT: i32 = 156;
pub const KEYCODE_NUMPAD_ADD: i32 = 157;
pub const KEYCODE_NUMPAD_DOT: i32 = 158;
pub const KEYCODE_NUMPAD_COMMA: i32 = 159;
pub const KEYCODE_NUMPAD_ENTER: i32 = 160;
pub const KEYCODE_NUMPAD_EQUALS: i32 = 161;
pub const KEYCODE_APP_SWITCH: i32 = 187;

/// Map a physical key code name to its Android keycode.
pub fn android_keycode(code: &str) -> Option<i32> {
    // Contiguous ranges first: letters, digits, function keys, numpad digits.
    if let Some(rest) = code.strip_prefix("Key") {
        if let [c] = rest.as_bytes()
            && c.is_ascii_uppercase()
        {
            return Some(KEYCODE_A + i32::from(c - b'A'));
        }
        return None;
    }
    if let Some(rest) = code.strip_prefix("Digit") {
        if let [c] = rest.as_bytes()
            && c.is_ascii_digit()
        {
            return Some(KEYCODE_0 + i32::from(c - b'0'));
        }
        return None;
    }
    if let Some(rest) = code.strip_prefix("Numpad")
        && let [c] = rest.as_bytes()
        && c.is_ascii_digit()
    {
        return Some(KEYCODE_NUMPAD_0 + i32::from(c - b'0'));
    }
    if let Some(rest) = code.strip_prefix('F')
        && let Ok(n) = rest.parse::<i32>()
        && (1..=12).contains(&n)
        && !rest.starts_with('0')
    {
        return Some(KEYCODE_F1 + n - 1);
    }

    let keycode = match code {
        "Backquote" => KEYCODE_GRAVE,
        "Minus" => KEYCODE_MINUS,
        "Equal" => KEYCODE_EQUALS,
        "BracketLeft" => KEYCODE_LEFT_BRACKET,
        "BracketRight" => KEYCODE_RIGHT_BRACKET,
        "Backslash" => KEYCODE_BACKSLASH,
        "Semicolon" => KEYCODE_SEMICOLON,
        "Quote" => KEYCODE_APOSTROPHE,
        "Comma" => KEYCODE_COMMA,
        "Period" => KEYCODE_PERIOD,
        "Slash" => KEYCODE_SLASH,
        "Space" => KEYCODE_SPACE,
        "Tab" => KEYCODE_TAB,
        "Escape" => KEYCODE_ESCAPE,
        "ArrowUp" => KEYCODE_DPAD_UP,
        "ArrowDown" => KEYCODE_DPAD_DOWN,
        "ArrowLeft" => KEYCODE_DPAD_LEFT,
        "ArrowRight" => KEYCODE_DPAD_RIGHT,
        "Enter" => KEYCODE_ENTER,
        "Backspace" => KEYCODE_DEL,
        "Delete" => KEYCODE_FORWARD_DEL,
        "Home" => KEYCODE_MOVE_HOME,
        "End" => KEYCODE_MOVE_END,
        "PageUp" => KEYCODE_PAGE_UP,
        "PageDown" => KEYCODE_PAGE_DOWN,
        "Insert" => KEYCODE_INSERT,
        "ShiftLeft" => KEYCODE_SHIFT_LEFT,
        "ShiftRight" => KEYCODE_SHIFT_RIGHT,
        "ControlLeft" => KEYCODE_CTRL_LEFT,
        "ControlRight" => KEYCODE_CTRL_RIGHT,
        "AltLeft" => KEYCODE_ALT_LEFT,
        "AltRight" => KEYCODE_ALT_RIGHT,
        "MetaLeft" => KEYCODE_META_LEFT,
        "MetaRight" => KEYCODE_META_RIGHT,
        "ContextMenu" => KEYCODE_MENU,
        "NumpadDivide" => KEYCODE_NUMPAD_DIVIDE,
        "NumpadMultiply" => KEYCODE_NUMPAD_MULTIPLY,
        "NumpadSubtract" => KEYCODE_NUMPAD_SUBTRACT,
        "NumpadAdd" => KEYCODE_NUMPAD_ADD,
        "NumpadDecimal" => KEYCODE_NUMPAD_DOT,
        "NumpadComma" => KEYCODE_NUMPAD_COMMA,
        "NumpadEnter" => KEYCODE_NUMPAD_ENTER,
        "NumpadEqual" => KEYCODE_NUMPAD_EQUALS,
        // Device buttons without a keyboard equivalent
        "AndroidHome" => KEYCODE_HOME,
        "AndroidBack" => KEYCODE_BACK,
        "AndroidAppSwitch" => KEYCODE_APP_SWITCH,
        "AndroidPower" => KEYCODE_POWER,
        "AudioVolumeUp" => KEYCODE_VOLUME_UP,
        "AudioVolumeDown" => KEYCODE_VOLUME_DOWN,
        _ => return None,
    };
    Some(keycode)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventType {
    Keydown,
    Keyup,
}

/// A keyboard event identified by physical key code, with modifier state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    #[serde(rename = "type")]
    pub kind: KeyEventType,
    pub code: String,
    #[serde(default)]
    pub shift_key: bool,
    #[serde(default)]
    pub alt_key: bool,
    #[serde(default)]
    pub ctrl_key: bool,
    #[serde(default)]
    pub meta_key: bool,
}

impl KeyEvent {
    pub fn down(code: impl Into<String>) -> Self {
        Self::new(KeyEventType::Keydown, code)
    }

    pub fn up(code: impl Into<String>) -> Self {
        Self::new(KeyEventType::Keyup, code)
    }

    fn new(kind: KeyEventType, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            shift_key: false,
            alt_key: false,
            ctrl_key: false,
            meta_key: false,
        }
    }

    pub fn meta_state(&self) -> i32 {
        let mut meta = META_NONE;
        if self.shift_key {
            meta |= META_SHIFT_ON;
        }
        if self.alt_key {
            meta |= META_ALT_ON;
        }
        if self.ctrl_key {
            meta |= META_CTRL_ON;
        }
        if self.meta_key {
            meta |= META_META_ON;
        }
        meta
    }

    /// Encode as an `InjectKeycode` message, or `None` for unmapped keys.
    pub fn to_control_message(&self) -> Option<ControlMessage> {
        let keycode = android_keycode(&self.code)?;
        let action = match self.kind {
            KeyEventType::Keydown => Action::Down,
            KeyEventType::Keyup => Action::Up,
        };
        Some(ControlMessage::keycode(action, keycode, self.meta_state()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_map_to_contiguous_range() {
        assert_eq!(android_keycode("KeyA"), Some(29));
        assert_eq!(android_keycode("KeyM"), Some(41));
        assert_eq!(android_keycode("KeyZ"), Some(54));
    }

    #[test]
    fn digits_and_numpad() {
        assert_eq!(android_keycode("Digit0"), Some(7));
        assert_eq!(android_keycode("Digit9"), Some(16));
        assert_eq!(android_keycode("Numpad0"), Some(144));
        assert_eq!(android_keycode("Numpad9"), Some(153));
        assert_eq!(android_keycode("NumpadEnter"), Some(160));
    }

    #[test]
    fn function_keys() {
        assert_eq!(android_keycode("F1"), Some(131));
        assert_eq!(android_keycode("F12"), Some(142));
        assert_eq!(android_keycode("F13"), None);
        assert_eq!(android_keycode("F0"), None);
        assert_eq!(android_keycode("F01"), None);
    }

    #[test]
    fn named_keys() {
        assert_eq!(android_keycode("Enter"), Some(66));
        assert_eq!(android_keycode("Backspace"), Some(67));
        assert_eq!(android_keycode("Delete"), Some(112));
        assert_eq!(android_keycode("ArrowUp"), Some(19));
        assert_eq!(android_keycode("ContextMenu"), Some(82));
        assert_eq!(android_keycode("Escape"), Some(111));
    }

    #[test]
    fn unmapped_keys_are_none() {
        assert_eq!(android_keycode(""), None);
        assert_eq!(android_keycode("Key"), None);
        assert_eq!(android_keycode("Keya"), None);
        assert_eq!(android_keycode("KeyAB"), None);
        assert_eq!(android_keycode("Digit10"), None);
        assert_eq!(android_keycode("CapsLock"), None);
        assert_eq!(android_keycode("Fn"), None);
    }

    #[test]
    fn key_a_down_encodes_plain_keycode() {
        let msg = KeyEvent::down("KeyA").to_control_message().unwrap();
        assert_eq!(msg, ControlMessage::keycode(Action::Down, 29, 0));
        assert_eq!(
            msg.encode(),
            vec![0, 0, 29, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn modifiers_fold_into_meta_state() {
        let mut event = KeyEvent::up("KeyC");
        event.shift_key = true;
        event.ctrl_key = true;
        assert_eq!(event.meta_state(), META_SHIFT_ON | META_CTRL_ON);
        match event.to_control_message().unwrap() {
            ControlMessage::InjectKeycode {
                action, meta_state, ..
            } => {
                assert_eq!(action, Action::Up);
                assert_eq!(meta_state, 4097);
            }
            other => panic!("expected InjectKeycode, got {other:?}"),
        }
    }

    #[test]
    fn unknown_key_produces_no_message() {
        assert!(KeyEvent::down("LaunchMail").to_control_message().is_none());
    }

    #[test]
    fn key_event_from_json() {
        let event: KeyEvent =
            serde_json::from_str(r#"{"type":"keydown","code":"KeyA","shiftKey":true}"#).unwrap();
        assert_eq!(event.kind, KeyEventType::Keydown);
        assert_eq!(event.code, "KeyA");
        assert!(event.shift_key);
        assert!(!event.ctrl_key);
    }
}
