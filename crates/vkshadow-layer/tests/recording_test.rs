//! Integration test: command recording
//!
//! Drives the recorder through a mock driver and checks the frozen record:
//! section tree shape, label recovery, usage tracking, binding-state
//! snapshots and local capture.
//!
//! Run with: cargo test --test recording_test -- --nocapture

mod common;

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use common::*;
use vkshadow_layer::command::{Command, CommandKind};
use vkshadow_layer::section::{Child, SectionEnd, SectionKind};
use vkshadow_layer::{CommandBufferState, Device, LayerConfig, LayerError};

fn begin(device: &Device, cb: vk::CommandBuffer) {
    device
        .begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
        .expect("begin");
}

#[test]
fn test_flatten_matches_call_order() {
    let (driver, device) = setup(true);
    let (rp, fb, _) = render_target(&device, vk::ImageLayout::PRESENT_SRC_KHR);
    let buf = buffer(&device);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.fill_buffer(buf, 0, 64, 0).expect("fill");
    rec.begin_debug_label("frame", [1.0; 4]).expect("label");
    rec.begin_render_pass(rp, fb, full_area(), &[], vk::SubpassContents::INLINE)
        .expect("begin rp");
    rec.draw(3, 1, 0, 0).expect("draw");
    rec.next_subpass(vk::SubpassContents::INLINE).expect("next");
    rec.draw(6, 1, 0, 0).expect("draw");
    rec.end_render_pass().expect("end rp");
    rec.end_debug_label().expect("end label");
    rec.dispatch(4, 4, 1).expect("dispatch");
    let record = device.end_command_buffer(cb).expect("end");

    let flat: Vec<u32> = record.flatten().iter().map(|id| id.0).collect();
    assert_eq!(flat, (0..record.len() as u32).collect::<Vec<_>>());
    assert!(record.sections().iter().all(|s| !s.is_open()));
    assert_eq!(record.synthesized_closes(), 0);
    assert!(!record.broken_labels());
    assert_eq!(record.root().stats.total, record.len() as u32);
    assert_eq!(record.root().stats.draws, 2);

    // Every command reached the driver, in order.
    let kinds: Vec<CommandKind> = record.commands().map(|(_, c)| c.kind()).collect();
    let native = driver.state.lock().recorded[0].0;
    assert_eq!(driver.recorded_kinds(native), kinds);
}

#[test]
fn test_render_pass_sections_nest() {
    let (_driver, device) = setup(true);
    let (rp, fb, _) = render_target(&device, vk::ImageLayout::UNDEFINED);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let begin_rp = rec
        .begin_render_pass(rp, fb, full_area(), &[], vk::SubpassContents::INLINE)
        .expect("begin rp");
    let draw = rec.draw(3, 1, 0, 0).expect("draw");
    let end_rp = rec.end_render_pass().expect("end rp");
    let record = device.end_command_buffer(cb).expect("end");

    let root = record.root();
    let Child::Section(rp_section) = root.children[0] else {
        panic!("expected a render pass section");
    };
    let rp_section = record.section(rp_section);
    assert_eq!(rp_section.kind, SectionKind::RenderPass);
    assert_eq!(rp_section.begin, Some(begin_rp));
    assert_eq!(rp_section.end, SectionEnd::Command(end_rp));

    let subpass = record.section(record.section_of(draw));
    assert_eq!(subpass.kind, SectionKind::Subpass);
    assert_eq!(subpass.end, SectionEnd::Command(end_rp));
}

#[test]
fn test_unterminated_label_is_recovered() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let label = rec.begin_debug_label("A", [0.0; 4]).expect("label");
    let draw = rec.draw(3, 1, 0, 0).expect("draw");
    let record = device.end_command_buffer(cb).expect("end");

    assert!(record.broken_labels());
    assert_eq!(record.synthesized_closes(), 1);

    let section = record.section(record.section_of(draw));
    assert_eq!(section.kind, SectionKind::DebugLabel);
    assert_eq!(section.begin, Some(label));
    assert_eq!(section.end, SectionEnd::Synthesized);
    assert_eq!(record.pushed_labels(), vec!["A"]);
}

#[test]
fn test_label_end_inside_render_pass_closes_after_it() {
    let (_driver, device) = setup(true);
    let (rp, fb, _) = render_target(&device, vk::ImageLayout::UNDEFINED);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let label = rec.begin_debug_label("outer", [0.0; 4]).expect("label");
    rec.begin_render_pass(rp, fb, full_area(), &[], vk::SubpassContents::INLINE)
        .expect("begin rp");
    let end_label = rec.end_debug_label().expect("end label");
    rec.draw(3, 1, 0, 0).expect("draw");
    let end_rp = rec.end_render_pass().expect("end rp");
    let after = rec.dispatch(1, 1, 1).expect("dispatch");
    let record = device.end_command_buffer(cb).expect("end");

    assert!(record.broken_labels());
    // The end stays where it was recorded.
    assert_eq!(record.section(record.section_of(end_label)).kind, SectionKind::Subpass);

    let label_section = record
        .sections()
        .iter()
        .find(|s| s.begin == Some(label))
        .expect("label section");
    assert_eq!(label_section.end, SectionEnd::Synthesized);
    assert_eq!(record.section(record.section_of(end_rp)).kind, SectionKind::RenderPass);
    assert_eq!(record.section(record.section_of(after)).kind, SectionKind::Root);
    assert!(record.pushed_labels().is_empty());
    assert_eq!(record.synthesized_closes(), 1);
}

#[test]
fn test_label_end_without_begin_is_tolerated() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let end = rec.end_debug_label().expect("end label");
    let record = device.end_command_buffer(cb).expect("end");

    assert!(record.broken_labels());
    assert_eq!(record.section(record.section_of(end)).kind, SectionKind::Root);
    assert_eq!(record.synthesized_closes(), 0);
}

#[test]
fn test_usage_is_idempotent() {
    let (_driver, device) = setup(true);
    let src = buffer(&device);
    let dst = buffer(&device);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let first = rec.copy_buffer(src, dst, &[]).expect("copy");
    let second = rec.copy_buffer(src, dst, &[]).expect("copy");
    let third = rec.fill_buffer(src, 0, 16, 1).expect("fill");
    let record = device.end_command_buffer(cb).expect("end");

    let used = record.used();
    assert_eq!(used.buffers.len(), 2);
    assert_eq!(used.len(), 2);
    let entry = used.buffers.get(src.as_raw()).expect("src tracked");
    assert_eq!(entry.commands, vec![first, second, third]);
}

#[test]
fn test_transitive_pinning() {
    let (_driver, device) = setup(true);
    let set_layout = set_layout(&device, &[(vk::DescriptorType::UNIFORM_BUFFER, 1)]);
    let layout = pipeline_layout(&device, &[Arc::clone(&set_layout)]);
    let pipe = pipeline(&device, vk::PipelineBindPoint::COMPUTE, layout);
    let set = descriptor_set(&device, &set_layout);
    let (rp, fb, img) = render_target(&device, vk::ImageLayout::UNDEFINED);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.bind_pipeline(pipe).expect("bind pipeline");
    rec.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, 0, &[set], &[])
        .expect("bind sets");
    rec.begin_render_pass(rp, fb, full_area(), &[], vk::SubpassContents::INLINE)
        .expect("begin rp");
    rec.end_render_pass().expect("end rp");
    let record = device.end_command_buffer(cb).expect("end");

    let used = record.used();
    assert!(used.contains(layout.as_raw()));
    assert!(used.contains(img.as_raw()));
    assert_eq!(used.descriptor_pools.len(), 1);
    assert_eq!(used.image_views.len(), 1);
    assert_eq!(used.framebuffers.len(), 1);
}

#[test]
fn test_secondary_usage_is_flattened_into_primary() {
    let (_driver, device) = setup(true);
    let buf = buffer(&device);
    let img = image(&device, 1, 1);
    let secondary = command_buffers(&device, vk::CommandBufferLevel::SECONDARY, 1)[0];
    let cb = primary(&device);

    begin(&device, secondary);
    let rec = device.recorder(secondary).expect("recorder");
    rec.fill_buffer(buf, 0, 16, 0).expect("fill");
    rec.clear_color_image(img, vk::ImageLayout::GENERAL, [0; 4], &[])
        .expect("clear");
    let secondary_record = device.end_command_buffer(secondary).expect("end");

    begin(&device, cb);
    device
        .recorder(cb)
        .expect("recorder")
        .execute_commands(&[secondary])
        .expect("execute");
    let record = device.end_command_buffer(cb).expect("end");

    let used = record.used();
    let nested = secondary_record.used();
    assert!(used.len() >= nested.len());
    assert!(used.contains(buf.as_raw()));
    assert!(used.contains(img.as_raw()));
    assert_eq!(record.secondaries().len(), 1);
    assert!(Arc::ptr_eq(&record.secondaries()[0], &secondary_record));
}

#[test]
fn test_binding_snapshots_are_copy_on_write() {
    let (_driver, device) = setup(true);
    let layout = pipeline_layout(&device, &[]);
    let first_pipe = pipeline(&device, vk::PipelineBindPoint::GRAPHICS, layout);
    let second_pipe = pipeline(&device, vk::PipelineBindPoint::GRAPHICS, layout);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let before = rec.draw(3, 1, 0, 0).expect("draw");
    rec.bind_pipeline(first_pipe).expect("bind");
    let first = rec.draw(3, 1, 0, 0).expect("draw");
    let again = rec.draw(3, 1, 0, 0).expect("draw");
    rec.bind_pipeline(second_pipe).expect("bind");
    let second = rec.draw(3, 1, 0, 0).expect("draw");
    let record = device.end_command_buffer(cb).expect("end");

    let state_of = |id| match record.command(id) {
        Command::Draw { state, .. } => Arc::clone(state),
        other => panic!("expected draw, got {:?}", other.kind()),
    };
    assert!(state_of(before).pipeline.is_none());
    assert_eq!(
        state_of(first).pipeline.as_ref().map(|p| p.handle),
        Some(first_pipe)
    );
    assert_eq!(
        state_of(second).pipeline.as_ref().map(|p| p.handle),
        Some(second_pipe)
    );
    // Unchanged state between commands shares one snapshot.
    assert!(Arc::ptr_eq(&state_of(first), &state_of(again)));
}

#[test]
fn test_descriptor_binding_resizes_and_preserves() {
    let (_driver, device) = setup(true);
    let set_layout = set_layout(&device, &[(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 2)]);
    let layout = pipeline_layout(
        &device,
        &[Arc::clone(&set_layout), Arc::clone(&set_layout), Arc::clone(&set_layout)],
    );
    let high = descriptor_set(&device, &set_layout);
    let low = descriptor_set(&device, &set_layout);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, 2, &[high], &[16, 32])
        .expect("bind high");
    let after_high = rec.dispatch(1, 1, 1).expect("dispatch");
    rec.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, 0, &[low], &[])
        .expect("bind low");
    let after_low = rec.dispatch(1, 1, 1).expect("dispatch");
    let record = device.end_command_buffer(cb).expect("end");

    let sets_of = |id| match record.command(id) {
        Command::Dispatch { state, .. } => state.descriptors.sets.clone(),
        other => panic!("expected dispatch, got {:?}", other.kind()),
    };

    let sets = sets_of(after_high);
    assert_eq!(sets.len(), 3);
    assert!(sets[0].is_none() && sets[1].is_none());
    let bound = sets[2].as_ref().expect("set 2 bound");
    assert_eq!(bound.set.handle, high);
    assert_eq!(bound.dynamic_offsets, vec![16, 32]);

    let sets = sets_of(after_low);
    assert_eq!(sets.len(), 3);
    assert_eq!(sets[0].as_ref().map(|b| b.set.handle), Some(low));
    assert_eq!(sets[2].as_ref().map(|b| b.set.handle), Some(high));
}

fn disturbance_device(enabled: bool) -> Device {
    let driver = MockDriver::new(true, true);
    let mut config = LayerConfig::default();
    config.recording.invalidate_disturbed_descriptor_sets = enabled;
    device_with(&driver, config)
}

fn record_disturbance(device: &Device) -> Option<vk::DescriptorSet> {
    let a = set_layout(device, &[(vk::DescriptorType::UNIFORM_BUFFER, 1)]);
    let b = set_layout(device, &[(vk::DescriptorType::STORAGE_IMAGE, 1)]);
    let c = set_layout(device, &[(vk::DescriptorType::SAMPLER, 1)]);
    let first = pipeline_layout(device, &[Arc::clone(&a), Arc::clone(&b)]);
    let other = pipeline_layout(device, &[Arc::clone(&c), Arc::clone(&b)]);
    let set0 = descriptor_set(device, &a);
    let set1 = descriptor_set(device, &b);
    let replacement = descriptor_set(device, &c);
    let cb = primary(device);

    begin(device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, first, 0, &[set0, set1], &[])
        .expect("bind");
    rec.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, other, 0, &[replacement], &[])
        .expect("rebind");
    let dispatch = rec.dispatch(1, 1, 1).expect("dispatch");
    let record = device.end_command_buffer(cb).expect("end");

    match record.command(dispatch) {
        Command::Dispatch { state, .. } => state
            .descriptors
            .sets
            .get(1)
            .and_then(|s| s.as_ref().map(|b| b.set.handle)),
        other => panic!("expected dispatch, got {:?}", other.kind()),
    }
}

#[test]
fn test_disturbed_sets_cleared_when_enabled() {
    let device = disturbance_device(true);
    assert_eq!(record_disturbance(&device), None);
}

#[test]
fn test_disturbed_sets_kept_by_default() {
    let device = disturbance_device(false);
    assert!(record_disturbance(&device).is_some());
}

#[test]
fn test_dynamic_state_tracked() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.set_dynamic(vkshadow_layer::command::DynamicValue::LineWidth(2.0))
        .expect("line width");
    rec.set_dynamic(vkshadow_layer::command::DynamicValue::StencilReference {
        faces: vk::StencilFaceFlags::FRONT,
        reference: 7,
    })
    .expect("stencil");
    let draw = rec.draw(3, 1, 0, 0).expect("draw");
    let record = device.end_command_buffer(cb).expect("end");

    match record.command(draw) {
        Command::Draw { state, .. } => {
            assert_eq!(state.dynamic.line_width, Some(2.0));
            assert_eq!(state.dynamic.stencil_front.reference, 7);
            assert_eq!(state.dynamic.stencil_back.reference, 0);
        }
        other => panic!("expected draw, got {:?}", other.kind()),
    }
}

#[test]
fn test_local_capture_hits_next_command_only() {
    let driver = MockDriver::new(true, true);
    let hook = Arc::new(RecordingHook::default());
    let device = device_with(&driver, LayerConfig::default()).with_hook(hook.clone());
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    rec.request_local_capture("hot-loop").expect("request");
    rec.dispatch(8, 8, 1).expect("dispatch");
    rec.dispatch(1, 1, 1).expect("dispatch");
    device.end_command_buffer(cb).expect("end");

    let captures = hook.captures.lock();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0], ("hot-loop".to_string(), CommandKind::Dispatch));
}

#[test]
fn test_payloads_copied_into_arena() {
    let (_driver, device) = setup(true);
    let buf = buffer(&device);
    let cb = primary(&device);

    begin(&device, cb);
    let rec = device.recorder(cb).expect("recorder");
    let payload = vec![1u8, 2, 3, 4, 5];
    let update = rec.update_buffer(buf, 0, &payload).expect("update");
    drop(payload);
    let label = rec.insert_debug_label("marker", [0.0; 4]).expect("label");
    let record = device.end_command_buffer(cb).expect("end");

    match record.command(update) {
        Command::UpdateBuffer { data, .. } => assert_eq!(record.arena().bytes(*data), &[1, 2, 3, 4, 5]),
        other => panic!("expected update, got {:?}", other.kind()),
    }
    match record.command(label) {
        Command::InsertDebugLabel { name, .. } => assert_eq!(record.label_name(*name), "marker"),
        other => panic!("expected label, got {:?}", other.kind()),
    }
}

#[test]
fn test_acceleration_structure_build_flags_recorded() {
    use vkshadow_layer::recorder::AccelerationStructureBuildInfo;
    use vkshadow_layer::resource::AccelerationStructure;

    let (_driver, device) = setup(true);
    let dst = vk::AccelerationStructureKHR::from_raw(0xACC0);
    device.resources.acceleration_structures.insert(
        dst.as_raw(),
        Arc::new(AccelerationStructure { handle: dst, native: dst }),
    );
    let cb = primary(&device);

    begin(&device, cb);
    device
        .recorder(cb)
        .expect("recorder")
        .build_acceleration_structures(&[AccelerationStructureBuildInfo {
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            flags: vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            src: None,
            dst,
            geometry_count: 1,
        }])
        .expect("build");
    let record = device.end_command_buffer(cb).expect("end");

    assert_eq!(
        record.accel_build_flags(dst),
        Some(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    );
    assert!(record.used().contains(dst.as_raw()));
}

#[test]
fn test_unknown_handle_is_an_error() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);

    begin(&device, cb);
    let result = device
        .recorder(cb)
        .expect("recorder")
        .fill_buffer(vk::Buffer::from_raw(0xDEAD), 0, 4, 0);
    assert!(matches!(result, Err(LayerError::UnknownHandle { kind: "buffer", .. })));
    // Nothing was added.
    let record = device.end_command_buffer(cb).expect("end");
    assert!(record.is_empty());
}

#[test]
fn test_lifecycle_states() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);
    assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Initial));

    begin(&device, cb);
    assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Recording));
    device.end_command_buffer(cb).expect("end");
    assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Executable));
    assert_eq!(device.record_count(cb), 1);

    // Implicit reset on begin.
    begin(&device, cb);
    assert!(device.last_record(cb).is_none());
    device.end_command_buffer(cb).expect("end");
    assert_eq!(device.record_count(cb), 2);
    assert_eq!(device.last_record(cb).map(|r| r.record_id), Some(2));

    device
        .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
        .expect("reset");
    assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Initial));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "contract violation")]
fn test_recording_outside_begin_is_a_contract_violation() {
    let (_driver, device) = setup(true);
    let cb = primary(&device);
    let _ = device.recorder(cb).expect("recorder").dispatch(1, 1, 1);
}
