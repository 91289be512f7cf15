//! Pointer tracking for touch injection.
//!
//! The device video is letterboxed inside the view. Positions outside the
//! visible video never start a gesture; an active gesture that leaves the
//! video is released at its last position inside it.

use std::collections::HashMap;

use droidlink_protocol::{Action, BUTTON_PRIMARY, POINTER_ID_MOUSE, TouchEvent};

/// Where the video element sits on screen, in view coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Move,
    Up,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct PointerTracker {
    view: ViewRect,
    video_size: (u32, u32),
    /// Last inside position per active pointer
    active: HashMap<i64, (f64, f64)>,
}

impl PointerTracker {
    pub fn new(view: ViewRect, video_size: (u32, u32)) -> Self {
        Self {
            view,
            video_size,
            active: HashMap::new(),
        }
    }

    pub fn set_view(&mut self, view: ViewRect) {
        self.view = view;
    }

    pub fn set_video_size(&mut self, video_size: (u32, u32)) {
        self.video_size = video_size;
    }

    pub fn is_active(&self, pointer_id: i64) -> bool {
        self.active.contains_key(&pointer_id)
    }

    /// Map a view position into video pixels, or `None` if it falls in the
    /// letterbox bars or the video size is not known yet.
    pub fn to_video(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (vw, vh) = self.video_size;
        if vw == 0 || vh == 0 || self.view.width <= 0.0 || self.view.height <= 0.0 {
            return None;
        }
        let (vw, vh) = (f64::from(vw), f64::from(vh));

        let video_aspect = vw / vh;
        let view_aspect = self.view.width / self.view.height;
        let (shown_w, shown_h) = if video_aspect > view_aspect {
            (self.view.width, self.view.width / video_aspect)
        } else {
            (self.view.height * video_aspect, self.view.height)
        };
        let rel_x = x - self.view.left - (self.view.width - shown_w) / 2.0;
        let rel_y = y - self.view.top - (self.view.height - shown_h) / 2.0;

        if !(0.0..=shown_w).contains(&rel_x) || !(0.0..=shown_h).contains(&rel_y) {
            return None;
        }
        Some((
            (rel_x / shown_w * vw).clamp(0.0, vw),
            (rel_y / shown_h * vh).clamp(0.0, vh),
        ))
    }

    /// Feed one pointer update; returns the touch event to inject, if any.
    pub fn handle(
        &mut self,
        pointer_id: i64,
        phase: PointerPhase,
        x: f64,
        y: f64,
    ) -> Option<TouchEvent> {
        let inside = self.to_video(x, y);
        let (action, pos) = match phase {
            PointerPhase::Down => match inside {
                Some(pos) => {
                    self.active.insert(pointer_id, pos);
                    (Action::Down, pos)
                }
                None => {
                    self.active.remove(&pointer_id);
                    return None;
                }
            },
            PointerPhase::Move => {
                let pos = inside?;
                let last = self.active.get_mut(&pointer_id)?;
                *last = pos;
                (Action::Move, pos)
            }
            PointerPhase::Up | PointerPhase::Cancel => {
                let pos = self.active.remove(&pointer_id)?;
                let action = if phase == PointerPhase::Up {
                    Action::Up
                } else {
                    Action::Cancel
                };
                (action, pos)
            }
        };

        TouchEvent::new(
            action,
            pointer_id,
            pos.0,
            pos.1,
            self.video_size,
            1.0,
            BUTTON_PRIMARY,
            BUTTON_PRIMARY,
        )
    }

    /// Mouse leaving the view releases a held button.
    pub fn mouse_leave(&mut self, x: f64, y: f64) -> Option<TouchEvent> {
        if !self.is_active(POINTER_ID_MOUSE) {
            return None;
        }
        self.handle(POINTER_ID_MOUSE, PointerPhase::Up, x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1000x1000 view showing a portrait 500x1000 video: 250px bars left and right.
    fn tracker() -> PointerTracker {
        PointerTracker::new(
            ViewRect {
                left: 0.0,
                top: 0.0,
                width: 1000.0,
                height: 1000.0,
            },
            (500, 1000),
        )
    }

    #[test]
    fn letterbox_mapping() {
        let t = tracker();
        assert_eq!(t.to_video(250.0, 0.0), Some((0.0, 0.0)));
        assert_eq!(t.to_video(500.0, 500.0), Some((250.0, 500.0)));
        assert_eq!(t.to_video(750.0, 1000.0), Some((500.0, 1000.0)));
        assert_eq!(t.to_video(100.0, 500.0), None);
        assert_eq!(t.to_video(900.0, 500.0), None);
    }

    #[test]
    fn view_offset_is_applied() {
        let mut t = tracker();
        t.set_view(ViewRect {
            left: 100.0,
            top: 50.0,
            width: 1000.0,
            height: 1000.0,
        });
        assert_eq!(t.to_video(600.0, 550.0), Some((250.0, 500.0)));
    }

    #[test]
    fn down_outside_video_is_ignored() {
        let mut t = tracker();
        assert!(t.handle(POINTER_ID_MOUSE, PointerPhase::Down, 10.0, 10.0).is_none());
        assert!(!t.is_active(POINTER_ID_MOUSE));
        assert!(t.handle(POINTER_ID_MOUSE, PointerPhase::Move, 500.0, 500.0).is_none());
        assert!(t.handle(POINTER_ID_MOUSE, PointerPhase::Up, 500.0, 500.0).is_none());
    }

    #[test]
    fn gesture_releases_at_last_inside_position() {
        let mut t = tracker();
        let down = t.handle(7, PointerPhase::Down, 500.0, 500.0).unwrap();
        assert_eq!(down.action, Action::Down);
        assert_eq!((down.x, down.y), (250, 500));
        assert_eq!(down.pointer_id, 7);
        assert_eq!(down.pressure, 0xFFFF);
        assert_eq!((down.video_width, down.video_height), (500, 1000));

        let mv = t.handle(7, PointerPhase::Move, 600.0, 600.0).unwrap();
        assert_eq!(mv.action, Action::Move);
        assert_eq!((mv.x, mv.y), (350, 600));

        // Leaves the video: no event, position kept
        assert!(t.handle(7, PointerPhase::Move, 950.0, 600.0).is_none());

        let up = t.handle(7, PointerPhase::Up, 950.0, 600.0).unwrap();
        assert_eq!(up.action, Action::Up);
        assert_eq!((up.x, up.y), (350, 600));
        assert!(!t.is_active(7));
    }

    #[test]
    fn cancel_uses_cancel_action() {
        let mut t = tracker();
        t.handle(1, PointerPhase::Down, 500.0, 500.0).unwrap();
        let cancel = t.handle(1, PointerPhase::Cancel, 0.0, 0.0).unwrap();
        assert_eq!(cancel.action, Action::Cancel);
        assert_eq!((cancel.x, cancel.y), (250, 500));
    }

    #[test]
    fn pointers_are_independent() {
        let mut t = tracker();
        t.handle(1, PointerPhase::Down, 300.0, 300.0).unwrap();
        t.handle(2, PointerPhase::Down, 700.0, 700.0).unwrap();
        let up1 = t.handle(1, PointerPhase::Up, 300.0, 300.0).unwrap();
        assert_eq!(up1.pointer_id, 1);
        assert!(t.is_active(2));
        assert!(t.handle(1, PointerPhase::Move, 400.0, 400.0).is_none());
    }

    #[test]
    fn mouse_leave_releases_only_when_held() {
        let mut t = tracker();
        assert!(t.mouse_leave(0.0, 0.0).is_none());
        t.handle(POINTER_ID_MOUSE, PointerPhase::Down, 500.0, 500.0).unwrap();
        let up = t.mouse_leave(0.0, 0.0).unwrap();
        assert_eq!(up.action, Action::Up);
        assert_eq!(up.pointer_id, POINTER_ID_MOUSE);
    }

    #[test]
    fn unknown_video_size_produces_nothing() {
        let mut t = tracker();
        t.set_video_size((0, 0));
        assert!(t.handle(1, PointerPhase::Down, 500.0, 500.0).is_none());
        assert!(!t.is_active(1));
    }
}
