//! Buffer and view behavior through the public API.

use std::sync::Arc;

use tileforge::{
    Access, Buffer, CpuEngine, Engine, Storage, SyncMode, TensorDesc, TensorView, TileForgeError,
};

fn engine() -> Arc<dyn Engine> {
    Arc::new(CpuEngine::new())
}

#[test]
fn map_identity_for_host_reachable_storage() {
    let buf = Buffer::new(engine(), 256, Storage::Managed).unwrap();
    let ptr = buf.map(32, 64, Access::ReadWrite).unwrap();
    assert_eq!(ptr as usize, buf.data_ptr() as usize + 32);
    buf.unmap(ptr).unwrap();
}

#[test]
fn map_pairs_are_tracked_per_buffer() {
    let a = Buffer::new(engine(), 128, Storage::Managed).unwrap();
    let b = Buffer::new(engine(), 128, Storage::Managed).unwrap();

    let ptr = a.map(0, 64, Access::Read).unwrap();
    // Unmapping through the wrong buffer must fail and leave the region booked.
    assert!(matches!(
        b.unmap(ptr).unwrap_err(),
        TileForgeError::Usage(_)
    ));
    assert_eq!(a.mapped_region_count(), 1);
    a.unmap(ptr).unwrap();
    assert_eq!(a.mapped_region_count(), 0);
}

#[test]
fn write_then_read_through_view() {
    let buf = Buffer::new(engine(), 256, Storage::Managed).unwrap();
    let view = TensorView::new(&buf, 64, TensorDesc::chw(1, 2, 2)).unwrap();

    let bytes: Vec<u8> = [1.5f32, -2.0, 0.25, 8.0]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    buf.write(64, &bytes, SyncMode::Sync).unwrap();

    assert_eq!(view.as_f32_slice().unwrap(), &[1.5, -2.0, 0.25, 8.0]);
}

#[test]
fn views_track_address_across_realloc() {
    let buf = Buffer::new(engine(), 1024, Storage::Managed).unwrap();
    let views: Vec<TensorView> = (0..4)
        .map(|i| TensorView::new(&buf, i * 256, TensorDesc::chw(1, 4, 4)).unwrap())
        .collect();
    assert_eq!(buf.attached_view_count(), 4);

    buf.realloc(4096).unwrap();

    let base = buf.data_ptr() as usize;
    for (i, view) in views.iter().enumerate() {
        assert_eq!(view.as_ptr() as usize, base + i * 256);
    }
}

#[test]
fn dropped_views_leave_the_registry() {
    let buf = Buffer::new(engine(), 512, Storage::Managed).unwrap();
    let keep = TensorView::new(&buf, 0, TensorDesc::chw(1, 2, 2)).unwrap();
    {
        let _tmp = TensorView::new(&buf, 256, TensorDesc::chw(1, 2, 2)).unwrap();
        assert_eq!(buf.attached_view_count(), 2);
    }
    assert_eq!(buf.attached_view_count(), 1);

    // Realloc after the drop must only touch the surviving view.
    buf.realloc(1024).unwrap();
    assert_eq!(buf.attached_view_count(), 1);
    assert_eq!(keep.as_ptr() as usize, buf.data_ptr() as usize);
}

#[test]
fn realloc_failure_is_not_destructive() {
    let engine: Arc<dyn Engine> = Arc::new(CpuEngine::with_alloc_limit(200));
    let buf = Buffer::new(engine, 128, Storage::Managed).unwrap();
    let view = TensorView::new(&buf, 0, TensorDesc::chw(1, 4, 4)).unwrap();
    let old_base = buf.data_ptr();

    let err = buf.realloc(4096).unwrap_err();
    assert!(matches!(err, TileForgeError::Allocation(_)));
    assert_eq!(buf.byte_size(), 128);
    assert_eq!(buf.data_ptr(), old_base);
    assert_eq!(view.as_ptr(), old_base);
}

#[test]
fn alloc_limit_accounts_frees() {
    let cpu = Arc::new(CpuEngine::with_alloc_limit(1024));
    let engine: Arc<dyn Engine> = cpu.clone();
    {
        let _a = Buffer::new(engine.clone(), 600, Storage::Managed).unwrap();
        assert!(Buffer::new(engine.clone(), 600, Storage::Managed).is_err());
        assert_eq!(cpu.live_bytes(), 600);
    }
    // After the first buffer is dropped the budget is available again.
    assert_eq!(cpu.live_bytes(), 0);
    let _b = Buffer::new(engine, 600, Storage::Managed).unwrap();
}

#[test]
fn device_storage_unsupported_on_cpu() {
    let err = Buffer::new(engine(), 64, Storage::Device).unwrap_err();
    assert!(matches!(err, TileForgeError::Unsupported(_)));
}
