use serde::Serialize;
use tracing::{debug, info};

use vkr_core::ReplayConfig;
use vkr_trace::{EntryPoint, Packet, PacketSource};

use crate::context::ReplayContext;
use crate::dispatch::{Dispatcher, Outcome};
use crate::driver::ReplayDriver;
use crate::error::ReplayError;
use crate::frame::{FrameAction, FrameController};

/// Receives every packet after it has been replayed and restored.
pub trait PacketObserver {
    fn on_packet(&mut self, packet: &Packet, outcome: &Outcome);

    fn on_finish(&mut self, _stats: &ReplayStats) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub packets: u64,
    pub replayed: u64,
    pub skipped: u64,
    pub mismatches: u64,
    pub frames: u64,
    pub loops: u32,
}

pub struct Replayer<D> {
    dispatcher: Dispatcher<D>,
    frames: FrameController,
    looping: bool,
    observers: Vec<Box<dyn PacketObserver>>,
}

impl<D: ReplayDriver> Replayer<D> {
    pub fn new(driver: D, config: &ReplayConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(driver, config),
            frames: FrameController::new(config.frames.clone()),
            looping: config.frames.loops(),
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn PacketObserver>) {
        self.observers.push(observer);
    }

    pub fn driver(&self) -> &D {
        self.dispatcher.driver()
    }

    pub fn driver_mut(&mut self) -> &mut D {
        self.dispatcher.driver_mut()
    }

    pub fn context(&self) -> &ReplayContext {
        self.dispatcher.context()
    }

    pub fn current_frame(&self) -> u64 {
        self.frames.current_frame()
    }

    pub fn into_driver(self) -> D {
        self.dispatcher.into_driver()
    }

    /// Replay `source` to the end of the trace or of the configured range.
    pub fn run(&mut self, source: &mut dyn PacketSource) -> Result<ReplayStats, ReplayError> {
        if self.looping && !source.can_rewind() {
            return Err(ReplayError::Config(
                "looping a frame range needs a rewindable trace store (try preloading)".into(),
            ));
        }

        let header = source.header();
        info!(
            arch = %header.arch,
            os = %header.os,
            pointer_size = header.pointer_size,
            driver = self.dispatcher.driver().name(),
            "starting replay"
        );
        for (i, gpu) in header.gpus.iter().enumerate() {
            info!(
                gpu = i,
                vendor_id = gpu.vendor_id,
                device_id = gpu.device_id,
                driver_version = gpu.driver_version,
                "trace GPU"
            );
        }

        let mut stats = ReplayStats::default();
        loop {
            self.frames.before_packet(source.position());
            let Some(mut packet) = source.next_packet()? else {
                match self.frames.on_end_of_stream() {
                    FrameAction::Rewind(pos) => {
                        source.seek(pos)?;
                        continue;
                    }
                    FrameAction::Continue | FrameAction::Stop => break,
                }
            };

            let outcome = self.dispatcher.dispatch(&mut packet)?;
            stats.packets += 1;
            match &outcome {
                Outcome::Replayed { mismatch, .. } => {
                    stats.replayed += 1;
                    if *mismatch {
                        stats.mismatches += 1;
                    }
                }
                Outcome::Skipped(_) => stats.skipped += 1,
            }
            for observer in &mut self.observers {
                observer.on_packet(&packet, &outcome);
            }

            if packet.entry_point().is_ok_and(EntryPoint::is_present) {
                let action = self.frames.on_present();
                debug!(frame = self.frames.current_frame(), "present");
                match action {
                    FrameAction::Continue => {}
                    FrameAction::Rewind(pos) => source.seek(pos)?,
                    FrameAction::Stop => break,
                }
            }
        }

        stats.frames = self.frames.presented();
        stats.loops = self.frames.loops_done();
        info!(
            packets = stats.packets,
            skipped = stats.skipped,
            mismatches = stats.mismatches,
            frames = stats.frames,
            "replay finished"
        );
        for observer in &mut self.observers {
            observer.on_finish(&stats);
        }
        Ok(stats)
    }
}
