//! Frame counting and looped replay of a frame range.
//!
//! Frame `n` is everything between the `n`th and `n + 1`th present. The
//! packets before `loop_start_frame` replay once to build up state; the range
//! `[loop_start_frame, loop_end_frame]` then replays `num_loops` times.

use tracing::{debug, info};
use vkr_core::FrameSettings;
use vkr_trace::StorePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Seek the store back to the start of the loop range.
    Rewind(StorePosition),
    Stop,
}

pub struct FrameController {
    settings: FrameSettings,
    frame: u64,
    presented: u64,
    loops_done: u32,
    loop_start: Option<StorePosition>,
}

impl FrameController {
    pub fn new(settings: FrameSettings) -> Self {
        Self {
            settings,
            frame: 0,
            presented: 0,
            loops_done: 0,
            loop_start: None,
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// Presents replayed so far, across every loop.
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Passes over the loop range finished so far.
    pub fn loops_done(&self) -> u32 {
        self.loops_done
    }

    /// Call with the store position of the packet about to be read.
    pub fn before_packet(&mut self, pos: StorePosition) {
        if self.loop_start.is_none() && self.frame == self.settings.loop_start_frame {
            debug!(frame = self.frame, packet = pos.packet_index, "loop range starts");
            self.loop_start = Some(pos);
        }
    }

    /// Call after every present packet, whether or not it replayed.
    pub fn on_present(&mut self) -> FrameAction {
        self.presented += 1;
        let finished = self.frame;
        self.frame += 1;
        if finished != self.settings.loop_end_frame {
            return FrameAction::Continue;
        }
        self.end_of_range()
    }

    pub fn on_end_of_stream(&mut self) -> FrameAction {
        if self.loop_start.is_none() {
            return FrameAction::Stop;
        }
        self.end_of_range()
    }

    fn end_of_range(&mut self) -> FrameAction {
        self.loops_done += 1;
        match self.loop_start {
            Some(pos) if self.loops_done < self.settings.num_loops => {
                info!(
                    pass = self.loops_done + 1,
                    of = self.settings.num_loops,
                    from_frame = self.settings.loop_start_frame,
                    "replaying frame range again"
                );
                self.frame = self.settings.loop_start_frame;
                FrameAction::Rewind(pos)
            }
            _ => FrameAction::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(packet_index: u64) -> StorePosition {
        StorePosition {
            byte_offset: packet_index * 100,
            packet_index,
        }
    }

    fn settings(start: u64, end: u64, loops: u32) -> FrameSettings {
        FrameSettings {
            loop_start_frame: start,
            loop_end_frame: end,
            num_loops: loops,
        }
    }

    #[test]
    fn test_counts_every_present() {
        let mut frames = FrameController::new(FrameSettings::default());
        frames.before_packet(at(0));
        for _ in 0..3 {
            assert_eq!(frames.on_present(), FrameAction::Continue);
        }
        assert_eq!(frames.current_frame(), 3);
        assert_eq!(frames.presented(), 3);
        assert_eq!(frames.on_end_of_stream(), FrameAction::Stop);
    }

    #[test]
    fn test_stops_after_end_frame() {
        let mut frames = FrameController::new(settings(0, 1, 1));
        frames.before_packet(at(0));
        assert_eq!(frames.on_present(), FrameAction::Continue);
        assert_eq!(frames.on_present(), FrameAction::Stop);
        assert_eq!(frames.loops_done(), 1);
    }

    #[test]
    fn test_rewinds_to_first_packet_of_start_frame() {
        let mut frames = FrameController::new(settings(1, 2, 2));
        frames.before_packet(at(0));
        assert_eq!(frames.on_present(), FrameAction::Continue);
        frames.before_packet(at(5));
        frames.before_packet(at(6));
        assert_eq!(frames.on_present(), FrameAction::Continue);
        assert_eq!(frames.on_present(), FrameAction::Rewind(at(5)));
        assert_eq!(frames.current_frame(), 1);

        frames.before_packet(at(5));
        assert_eq!(frames.on_present(), FrameAction::Continue);
        assert_eq!(frames.on_present(), FrameAction::Stop);
        assert_eq!(frames.presented(), 5);
    }

    #[test]
    fn test_open_range_loops_at_end_of_stream() {
        let mut frames = FrameController::new(settings(0, u64::MAX, 2));
        frames.before_packet(at(0));
        frames.on_present();
        assert_eq!(frames.on_end_of_stream(), FrameAction::Rewind(at(0)));
        frames.before_packet(at(0));
        frames.on_present();
        assert_eq!(frames.on_end_of_stream(), FrameAction::Stop);
    }

    #[test]
    fn test_start_beyond_trace_never_loops() {
        let mut frames = FrameController::new(settings(10, 12, 3));
        frames.before_packet(at(0));
        frames.on_present();
        assert_eq!(frames.on_end_of_stream(), FrameAction::Stop);
    }
}
