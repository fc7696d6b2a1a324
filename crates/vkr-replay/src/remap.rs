//! Descriptor-driven remapping of a packet body.
//!
//! The walker visits every field of a call's layout, recursing into nested
//! records, and overwrites handle and index slots with their replay values
//! through a [`BodyPatch`]. It stops at the first field that cannot be
//! remapped; the patch restores whatever was already written.

use vkr_core::{IndexSpace, Lookup};
use vkr_trace::body::{fixed_size, FIRST_FIELD_POS, SLOT_SIZE};
use vkr_trace::{BodyPatch, EntryPoint, Field, FieldKind, ObjectKind, NULL_HANDLE};

use crate::context::{Anchor, ReplayContext};
use crate::error::CallError;

/// What a remap pass learned about a call.
#[derive(Debug, Default)]
pub struct Remapped {
    pub anchor: Anchor,
    /// Category and trace handles of the call's create field.
    pub created: Option<(ObjectKind, Vec<u64>)>,
    /// Non-null trace handles the call releases.
    pub destroyed: Vec<(ObjectKind, u64)>,
}

pub struct Remapper<'c, 'p, 'b> {
    ctx: &'c mut ReplayContext,
    patch: &'p mut BodyPatch<'b>,
    translate_indices: bool,
    out: Remapped,
}

impl<'c, 'p, 'b> Remapper<'c, 'p, 'b> {
    pub fn new(ctx: &'c mut ReplayContext, patch: &'p mut BodyPatch<'b>) -> Self {
        let translate_indices = ctx.compatibility_mode;
        Self {
            ctx,
            patch,
            translate_indices,
            out: Remapped::default(),
        }
    }

    /// Leave index fields alone (the caller resolves them itself).
    pub fn without_indices(mut self) -> Self {
        self.translate_indices = false;
        self
    }

    pub fn run(mut self, entry: EntryPoint) -> Result<Remapped, CallError> {
        let schema = entry.fields();
        self.out.anchor = anchor_of(self.ctx, self.patch, schema);
        self.walk(schema, FIRST_FIELD_POS)?;
        Ok(self.out)
    }

    fn walk(&mut self, schema: &'static [Field], base: usize) -> Result<(), CallError> {
        for (i, field) in schema.iter().enumerate() {
            let pos = base + i * SLOT_SIZE;
            match field.kind {
                FieldKind::Value | FieldKind::Values | FieldKind::Bytes => {}
                FieldKind::Handle(kind) => self.handle(field.name, kind, pos)?,
                FieldKind::Handles(kind) => {
                    for at in elements(self.patch, pos, 8) {
                        self.handle(field.name, kind, at)?;
                    }
                }
                FieldKind::Create(kind) => {
                    self.out.created = Some((kind, vec![self.patch.read(pos)]));
                }
                FieldKind::CreateMany(kind) => {
                    let handles = elements(self.patch, pos, 8)
                        .into_iter()
                        .map(|at| self.patch.read(at))
                        .collect();
                    self.out.created = Some((kind, handles));
                }
                FieldKind::Destroy(kind) => self.destroy(field.name, kind, pos)?,
                FieldKind::DestroyMany(kind) => {
                    for at in elements(self.patch, pos, 8) {
                        self.destroy(field.name, kind, at)?;
                    }
                }
                FieldKind::QueueFamily => self.index(field.name, IndexSpace::QueueFamily, pos)?,
                FieldKind::QueueFamilies => {
                    for at in elements(self.patch, pos, 8) {
                        self.index(field.name, IndexSpace::QueueFamily, at)?;
                    }
                }
                FieldKind::MemoryType => self.index(field.name, IndexSpace::MemoryType, pos)?,
                FieldKind::Records(sub) => {
                    for at in elements(self.patch, pos, fixed_size(sub)) {
                        self.walk(sub, at)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle(&mut self, field: &'static str, kind: ObjectKind, pos: usize) -> Result<(), CallError> {
        let trace = self.patch.read(pos);
        match self.ctx.objects.lookup(kind, trace) {
            Lookup::Null => Ok(()),
            Lookup::Mapped(replay) => {
                self.patch.write(pos, replay);
                Ok(())
            }
            Lookup::Missing => Err(CallError::UnknownHandle {
                field,
                kind,
                handle: trace,
            }),
        }
    }

    fn destroy(&mut self, field: &'static str, kind: ObjectKind, pos: usize) -> Result<(), CallError> {
        let trace = self.patch.read(pos);
        self.handle(field, kind, pos)?;
        if trace != NULL_HANDLE {
            self.out.destroyed.push((kind, trace));
        }
        Ok(())
    }

    fn index(&mut self, field: &'static str, space: IndexSpace, pos: usize) -> Result<(), CallError> {
        if !self.translate_indices {
            return Ok(());
        }
        let pair = self
            .ctx
            .device_pair(self.out.anchor)
            .ok_or(CallError::NoDeviceContext { field })?;
        let trace_index = self.patch.read(pos) as u32;
        let resolved = self
            .ctx
            .compat
            .resolve(space, pair.trace, pair.replay, trace_index)
            .map_err(|source| CallError::Resolve { field, source })?;
        if resolved.index != trace_index {
            self.patch.write(pos, u64::from(resolved.index));
        }
        Ok(())
    }
}

/// The first non-null input handle of the top-level struct decides which
/// device a call's indices belong to.
fn anchor_of(ctx: &ReplayContext, patch: &BodyPatch<'_>, schema: &'static [Field]) -> Anchor {
    schema
        .iter()
        .enumerate()
        .find_map(|(i, field)| {
            let kind = match field.kind {
                FieldKind::Handle(kind) | FieldKind::Destroy(kind) => kind,
                _ => return None,
            };
            let handle = patch.read(FIRST_FIELD_POS + i * SLOT_SIZE);
            (handle != NULL_HANDLE).then(|| ctx.anchor_for(kind, handle))
        })
        .unwrap_or_default()
}

/// Body positions of the elements of the array whose slot is at `pos`.
/// Only valid on bodies that passed layout validation.
pub fn elements(patch: &BodyPatch<'_>, pos: usize, elem: usize) -> Vec<usize> {
    let offset = patch.read(pos) as usize;
    let count = patch.read(pos + 8) as usize;
    (0..count).map(|i| offset + i * elem).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkr_core::ReplayConfig;
    use vkr_trace::writer::{encode_body, Arg};

    fn ctx() -> ReplayContext {
        let mut ctx = ReplayContext::new(&ReplayConfig::default());
        ctx.objects.add(ObjectKind::PhysicalDevice, 0x10, 0x910);
        ctx.objects.add(ObjectKind::Device, 0x20, 0x920);
        ctx.add_device(0x20, 0x10);
        ctx.compat
            .record_trace(IndexSpace::QueueFamily, 0x10, vec![0x1, 0x2]);
        ctx.compat
            .record_replay(IndexSpace::QueueFamily, 0x910, vec![0x2, 0x1]);
        ctx
    }

    #[test]
    fn test_handles_and_indices_rewritten_then_restored() {
        let mut ctx = ctx();
        let mut body = encode_body(
            0,
            &[Arg::Value(0x20), Arg::Value(0), Arg::Value(1), Arg::Value(0x30)],
        );
        let original = body.clone();
        {
            let mut patch = BodyPatch::new(&mut body);
            let out = Remapper::new(&mut ctx, &mut patch)
                .run(EntryPoint::CreateCommandPool)
                .unwrap();
            assert_eq!(out.anchor.device, Some(0x20));
            assert_eq!(out.created, Some((ObjectKind::CommandPool, vec![0x30])));
            assert_eq!(patch.read(FIRST_FIELD_POS), 0x920);
            assert_eq!(patch.read(FIRST_FIELD_POS + 2 * SLOT_SIZE), 0);
        }
        assert_eq!(body, original);
    }

    #[test]
    fn test_unknown_handle_in_nested_record() {
        let mut ctx = ctx();
        ctx.objects.add(ObjectKind::Queue, 0x40, 0x940);
        let mut body = encode_body(
            0,
            &[
                Arg::Value(0x40),
                Arg::Records(vec![vec![
                    Arg::Values(vec![]),
                    Arg::Values(vec![]),
                    Arg::Values(vec![0xBAD]),
                    Arg::Values(vec![]),
                ]]),
                Arg::Value(0),
            ],
        );
        let original = body.clone();
        {
            let mut patch = BodyPatch::new(&mut body);
            let err = Remapper::new(&mut ctx, &mut patch)
                .run(EntryPoint::QueueSubmit)
                .unwrap_err();
            assert_eq!(
                err,
                CallError::UnknownHandle {
                    field: "command_buffers",
                    kind: ObjectKind::CommandBuffer,
                    handle: 0xBAD
                }
            );
        }
        assert_eq!(body, original);
    }

    #[test]
    fn test_index_without_device_context() {
        let mut ctx = ctx();
        ctx.objects.add(ObjectKind::Device, 0x21, 0x921);
        let mut body = encode_body(
            0,
            &[Arg::Value(0x21), Arg::Value(0), Arg::Value(0), Arg::Value(0x50)],
        );
        let mut patch = BodyPatch::new(&mut body);
        let err = Remapper::new(&mut ctx, &mut patch)
            .run(EntryPoint::GetDeviceQueue)
            .unwrap_err();
        assert_eq!(
            err,
            CallError::NoDeviceContext {
                field: "queue_family_index"
            }
        );
    }

    #[test]
    fn test_compat_off_leaves_indices() {
        let mut ctx = ctx();
        ctx.compatibility_mode = false;
        let mut body = encode_body(
            0,
            &[Arg::Value(0x20), Arg::Value(0), Arg::Value(0), Arg::Value(0x30)],
        );
        let mut patch = BodyPatch::new(&mut body);
        Remapper::new(&mut ctx, &mut patch)
            .run(EntryPoint::CreateCommandPool)
            .unwrap();
        assert_eq!(patch.read(FIRST_FIELD_POS + 2 * SLOT_SIZE), 0);
        assert_eq!(patch.patched(), 1);
    }

    #[test]
    fn test_destroy_collects_trace_handle() {
        let mut ctx = ctx();
        ctx.objects.add(ObjectKind::Fence, 0x60, 0x960);
        let mut body = encode_body(0, &[Arg::Value(0x20), Arg::Value(0x60)]);
        let mut patch = BodyPatch::new(&mut body);
        let out = Remapper::new(&mut ctx, &mut patch)
            .run(EntryPoint::DestroyFence)
            .unwrap();
        assert_eq!(out.destroyed, vec![(ObjectKind::Fence, 0x60)]);
        assert_eq!(patch.read(FIRST_FIELD_POS + SLOT_SIZE), 0x960);
    }
}
