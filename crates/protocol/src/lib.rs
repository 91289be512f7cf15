pub mod control;
pub mod keycodes;
pub mod messages;

pub use control::*;
pub use keycodes::{KeyEvent, KeyEventType, android_keycode};
pub use messages::*;
