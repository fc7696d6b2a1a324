use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;
use tracing::warn;

use vkr_replay::{Outcome, PacketObserver, ReplayStats};
use vkr_trace::{Fields, Packet};

// ── Per-call summary ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct CallCounts {
    calls: u64,
    skipped: u64,
    mismatches: u64,
}

/// Counts calls per entry point and prints a table when replay ends.
#[derive(Default)]
pub struct Summary {
    per_entry: BTreeMap<&'static str, CallCounts>,
}

impl PacketObserver for Summary {
    fn on_packet(&mut self, packet: &Packet, outcome: &Outcome) {
        let counts = self.per_entry.entry(packet.name()).or_default();
        counts.calls += 1;
        match outcome {
            Outcome::Skipped(_) => counts.skipped += 1,
            Outcome::Replayed { mismatch: true, .. } => counts.mismatches += 1,
            Outcome::Replayed { .. } => {}
        }
    }

    fn on_finish(&mut self, stats: &ReplayStats) {
        println!();
        println!("  {:<44} {:>9} {:>9} {:>9}", "ENTRY POINT", "CALLS", "SKIPPED", "MISMATCH");
        println!("  {}", "─".repeat(74));
        for (name, c) in &self.per_entry {
            println!("  {:<44} {:>9} {:>9} {:>9}", name, c.calls, c.skipped, c.mismatches);
        }
        println!("  {}", "─".repeat(74));
        println!(
            "  {} packets, {} replayed, {} skipped, {} mismatches, {} frames",
            stats.packets, stats.replayed, stats.skipped, stats.mismatches, stats.frames
        );
        if stats.loops > 1 {
            println!("  frame range replayed {} times", stats.loops);
        }
    }
}

// ── JSON dump ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PacketRecord<'a> {
    index: u64,
    thread: u32,
    entry: &'a str,
    status: &'static str,
    trace_result: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Decoded parameters as captured; absent when the body does not decode.
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Fields<'a>>,
}

#[derive(Serialize)]
struct FinishRecord<'a> {
    finished: &'a ReplayStats,
}

/// Writes one JSON object per packet, then the final statistics.
pub struct JsonDump {
    out: Box<dyn Write>,
    failed: bool,
}

impl JsonDump {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self { out, failed: false }
    }

    fn emit<T: Serialize>(&mut self, record: &T) {
        if self.failed {
            return;
        }
        let written = serde_json::to_writer(&mut self.out, record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(e) = written {
            warn!(error = %e, "JSON dump failed, disabling it");
            self.failed = true;
        }
    }
}

impl PacketObserver for JsonDump {
    fn on_packet(&mut self, packet: &Packet, outcome: &Outcome) {
        let mut record = PacketRecord {
            index: packet.header.global_index,
            thread: packet.header.thread_id,
            entry: packet.name(),
            status: "skipped",
            trace_result: packet.trace_result(),
            result: None,
            error: None,
            params: packet.fields().ok(),
        };
        match outcome {
            Outcome::Replayed { result, mismatch } => {
                record.status = if *mismatch { "mismatch" } else { "ok" };
                record.result = Some(format!("{result:?}"));
            }
            Outcome::Skipped(e) => record.error = Some(e.to_string()),
        }
        self.emit(&record);
    }

    fn on_finish(&mut self, stats: &ReplayStats) {
        self.emit(&FinishRecord { finished: stats });
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "failed to flush JSON dump");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    use vkr_replay::CallError;
    use vkr_trace::writer::encode_body;
    use vkr_trace::{Arg, EntryPoint, ObjectKind, PacketFlags, PacketHeader};

    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn packet(entry: EntryPoint, args: &[Arg]) -> Packet {
        let body = encode_body(0, args);
        Packet {
            header: PacketHeader {
                size: body.len() as u64,
                global_index: 7,
                thread_id: 1,
                packet_id: entry.id(),
                flags: PacketFlags::empty(),
            },
            body,
        }
    }

    fn lines(out: &Shared) -> Vec<serde_json::Value> {
        String::from_utf8(out.0.borrow().clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_dump_includes_decoded_parameters() {
        let out = Shared::default();
        let mut dump = JsonDump::new(Box::new(out.clone()));
        let submit = packet(EntryPoint::QueueSubmit, &[
            Arg::Value(0x4000),
            Arg::Records(vec![vec![
                Arg::Values(Vec::new()),
                Arg::Values(Vec::new()),
                Arg::Values(vec![0xA000]),
                Arg::Values(Vec::new()),
            ]]),
            Arg::Value(0),
        ]);
        let skipped = CallError::UnknownHandle {
            field: "command_buffers",
            kind: ObjectKind::CommandBuffer,
            handle: 0xA000,
        };
        dump.on_packet(&submit, &Outcome::Skipped(skipped));

        let record = &lines(&out)[0];
        assert_eq!(record["entry"], "vkQueueSubmit");
        assert_eq!(record["status"], "skipped");
        assert_eq!(record["params"]["queue"], 0x4000);
        assert_eq!(record["params"]["submits"][0]["command_buffers"][0], 0xA000);
    }

    #[test]
    fn test_dump_renders_text_blobs() {
        let out = Shared::default();
        let mut dump = JsonDump::new(Box::new(out.clone()));
        let instance = packet(EntryPoint::CreateInstance, &[
            Arg::string("demo"),
            Arg::Value(1),
            Arg::string("engine"),
            Arg::Value(1),
            Arg::Value(1 << 22),
            Arg::str_list(&[]),
            Arg::str_list(&["VK_KHR_surface", "VK_KHR_xcb_surface"]),
            Arg::Value(0x1000),
        ]);
        dump.on_packet(
            &instance,
            &Outcome::Replayed {
                result: ash::vk::Result::SUCCESS,
                mismatch: false,
            },
        );
        dump.on_finish(&ReplayStats::default());

        let records = lines(&out);
        let params = &records[0]["params"];
        assert_eq!(params["app_name"], "demo");
        assert_eq!(
            params["enabled_extensions"],
            serde_json::json!(["VK_KHR_surface", "VK_KHR_xcb_surface"])
        );
        assert_eq!(records[0]["status"], "ok");
        assert!(records[1].get("finished").is_some());
    }
}
