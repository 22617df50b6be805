//! Multi-user fan-out: the engine itself only ever talks to one
//! [`WireSink`], but a remote-desktop session usually has more than one
//! viewer attached. [`BroadcastSink`] is that single sink, implemented as a
//! dispatcher over one real sink per joined user.
//!
//! Ordinary frame traffic (`size`, `rect`, `png`, ...) goes to every joined
//! user identically -- every viewer is watching the same display. Only the
//! mouse cursor is user-specific: the user who is actually moving the mouse
//! sees it move because their own input loop already knows where it is:
//! echoing it back would just add latency. Every other user needs the
//! `mouse` instruction to see it at all, which is what
//! [`BroadcastSink::broadcast_mouse_excluding`] is for.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use display_proto::{CompositeMode, EncodedImage, LayerId, LayerParam, WireSink};

/// Identifies one joined viewer. Callers mint these; the engine only ever
/// uses them as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

/// Fans every [`WireSink`] call out to every currently-joined user's own
/// sink. A send failing for one user is logged and does not stop delivery
/// to the rest -- one viewer's broken connection should never freeze the
/// frame for everyone else.
pub struct BroadcastSink<U: WireSink> {
    users: Mutex<HashMap<UserId, U>>,
}

impl<U: WireSink> Default for BroadcastSink<U> {
    fn default() -> Self {
        BroadcastSink { users: Mutex::new(HashMap::new()) }
    }
}

impl<U: WireSink> BroadcastSink<U> {
    pub fn new() -> BroadcastSink<U> {
        BroadcastSink::default()
    }

    /// Registers a newly joined user's sink. Replaces any existing sink
    /// already registered under the same id.
    pub fn join(&self, id: UserId, sink: U) {
        self.users.lock().unwrap().insert(id, sink);
    }

    /// Unregisters a departing user, returning their sink if one was
    /// registered.
    pub fn leave(&self, id: UserId) -> Option<U> {
        self.users.lock().unwrap().remove(&id)
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    /// Runs `f` against exactly one user's own sink -- the seam a join-time
    /// resync uses to stream a new viewer's initial state without also
    /// broadcasting it to everyone already connected.
    pub fn with_user<R>(&self, id: UserId, f: impl FnOnce(&mut U) -> R) -> Option<R> {
        let mut users = self.users.lock().unwrap();
        users.get_mut(&id).map(f)
    }

    /// Sends a `mouse` instruction to every joined user except `excluded`
    /// (the user, if any, who is the one currently moving the cursor).
    pub fn broadcast_mouse_excluding(&self, excluded: Option<UserId>, x: i32, y: i32, mask: u32, timestamp: u64)
    where
        U::Error: Debug,
    {
        let mut users = self.users.lock().unwrap();
        for (id, sink) in users.iter_mut() {
            if Some(*id) == excluded {
                continue;
            }
            if let Err(err) = sink.send_mouse(x, y, mask, timestamp) {
                tracing::warn!(?err, user = id.0, "failed to broadcast mouse position");
            }
        }
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&mut U) -> Result<(), U::Error>,
        U::Error: Debug,
    {
        let mut users = self.users.lock().unwrap();
        for (id, sink) in users.iter_mut() {
            if let Err(err) = f(sink) {
                tracing::warn!(?err, user = id.0, "failed to deliver wire instruction to user");
            }
        }
    }
}

impl<U: WireSink> WireSink for BroadcastSink<U>
where
    U::Error: Debug,
{
    type Error = std::convert::Infallible;

    fn send_size(&mut self, layer: LayerId, width: i32, height: i32) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_size(layer, width, height));
        Ok(())
    }

    fn send_shade(&mut self, layer: LayerId, opacity: u8) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_shade(layer, opacity));
        Ok(())
    }

    fn send_move(&mut self, layer: LayerId, parent: LayerId, x: i32, y: i32, z: i32) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_move(layer, parent, x, y, z));
        Ok(())
    }

    fn send_set(&mut self, layer: LayerId, param: LayerParam) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_set(layer, param));
        Ok(())
    }

    fn send_rect(&mut self, layer: LayerId, x: i32, y: i32, width: i32, height: i32) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_rect(layer, x, y, width, height));
        Ok(())
    }

    fn send_cfill(&mut self, layer: LayerId, mode: CompositeMode, r: u8, g: u8, b: u8, a: u8) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_cfill(layer, mode, r, g, b, a));
        Ok(())
    }

    fn send_copy(
        &mut self,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
        mode: CompositeMode,
        dst_layer: LayerId,
        dx: i32,
        dy: i32,
    ) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_copy(src_layer, sx, sy, width, height, mode, dst_layer, dx, dy));
        Ok(())
    }

    fn send_image(&mut self, layer: LayerId, x: i32, y: i32, image: EncodedImage<'_>) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_image(layer, x, y, image));
        Ok(())
    }

    fn send_cursor(
        &mut self,
        hotspot_x: i32,
        hotspot_y: i32,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
    ) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_cursor(hotspot_x, hotspot_y, src_layer, sx, sy, width, height));
        Ok(())
    }

    fn send_mouse(&mut self, x: i32, y: i32, mask: u32, timestamp: u64) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_mouse(x, y, mask, timestamp));
        Ok(())
    }

    fn send_sync(&mut self, timestamp: u64, frame_count: u64) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_sync(timestamp, frame_count));
        Ok(())
    }

    fn send_dispose(&mut self, layer: LayerId) -> Result<(), Self::Error> {
        self.for_each(|u| u.send_dispose(layer));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.for_each(|u| u.flush());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use display_proto::RecordingSink;

    #[test]
    fn join_and_leave_track_membership() {
        let sink = BroadcastSink::<RecordingSink>::new();
        sink.join(UserId(1), RecordingSink::new());
        sink.join(UserId(2), RecordingSink::new());
        assert_eq!(sink.user_count(), 2);
        assert!(sink.leave(UserId(1)).is_some());
        assert_eq!(sink.user_count(), 1);
    }

    #[test]
    fn broadcast_reaches_every_joined_user() {
        let mut sink = BroadcastSink::<RecordingSink>::new();
        sink.join(UserId(1), RecordingSink::new());
        sink.join(UserId(2), RecordingSink::new());

        sink.send_sync(100, 1).unwrap();

        assert!(sink.with_user(UserId(1), |u| u.instructions.len()).unwrap() > 0);
        assert!(sink.with_user(UserId(2), |u| u.instructions.len()).unwrap() > 0);
    }

    #[test]
    fn mouse_broadcast_excludes_the_moving_user() {
        let sink = BroadcastSink::<RecordingSink>::new();
        sink.join(UserId(1), RecordingSink::new());
        sink.join(UserId(2), RecordingSink::new());

        sink.broadcast_mouse_excluding(Some(UserId(1)), 5, 6, 0, 1000);

        assert_eq!(sink.with_user(UserId(1), |u| u.instructions.len()).unwrap(), 0);
        assert_eq!(sink.with_user(UserId(2), |u| u.instructions.len()).unwrap(), 1);
    }
}
