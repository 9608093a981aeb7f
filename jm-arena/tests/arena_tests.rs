use std::ptr::NonNull;

use arena::{ArenaError, MemArena, ViewLayout, ViewSpec, allocation_granularity};

fn arena_with_segment(size: usize) -> MemArena {
    let mut arena = MemArena::new();
    arena
        .grab_shm_segment(size)
        .expect("backing segment should be allocated");
    arena
}

fn write_byte(view: NonNull<u8>, offset: usize, value: u8) {
    unsafe { view.as_ptr().add(offset).write_volatile(value) };
}

fn read_byte(view: NonNull<u8>, offset: usize) -> u8 {
    unsafe { view.as_ptr().add(offset).read_volatile() }
}

#[test]
fn segment_size_is_rounded_to_granularity() {
    let granularity = allocation_granularity();
    let mut arena = arena_with_segment(granularity + 1);
    assert!(arena.has_segment());
    assert_eq!(arena.segment_size(), granularity * 2);
    arena.release_shm_segment().expect("release should succeed");
    assert!(!arena.has_segment());
}

#[test]
fn second_grab_is_rejected_without_leaking_the_first() {
    let granularity = allocation_granularity();
    let mut arena = arena_with_segment(granularity);
    let err = arena
        .grab_shm_segment(granularity)
        .expect_err("second grab must fail");
    assert!(matches!(err, ArenaError::InvalidState(_)));
    assert_eq!(arena.segment_size(), granularity);
    arena.release_shm_segment().expect("release should succeed");
    assert!(matches!(
        arena.release_shm_segment(),
        Err(ArenaError::InvalidState(_))
    ));
}

#[test]
fn zero_sized_segment_is_an_allocation_failure() {
    let mut arena = MemArena::new();
    let err = arena.grab_shm_segment(0).expect_err("zero size must fail");
    assert!(matches!(err, ArenaError::AllocationFailure(_)));
    assert!(!err.is_recoverable());
}

#[test]
fn writes_through_one_view_are_visible_through_another() {
    let granularity = allocation_granularity();
    let size = granularity * 4;
    let mut arena = arena_with_segment(size);

    let first = arena.create_view(0, size, None).expect("first view");
    let second = arena.create_view(0, size, None).expect("second view");
    assert_ne!(first, second);

    for offset in [0, 1, granularity, size - 1] {
        let value = (offset % 251) as u8 ^ 0x5A;
        write_byte(first, offset, value);
        assert_eq!(read_byte(second, offset), value, "offset {offset:#x}");
    }

    write_byte(second, 7, 0xC3);
    assert_eq!(read_byte(first, 7), 0xC3);

    unsafe {
        arena.release_view(first, size).expect("release first");
        arena.release_view(second, size).expect("release second");
    }
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn partial_views_alias_the_matching_segment_offset() {
    let granularity = allocation_granularity();
    let size = granularity * 4;
    let mut arena = arena_with_segment(size);

    let whole = arena.create_view(0, size, None).expect("whole view");
    let tail = arena
        .create_view(granularity * 2, granularity, None)
        .expect("tail view");

    write_byte(tail, 3, 0x42);
    assert_eq!(read_byte(whole, granularity * 2 + 3), 0x42);

    unsafe {
        arena.release_view(tail, granularity).expect("release tail");
        arena.release_view(whole, size).expect("release whole");
    }
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn view_outside_segment_is_a_mapping_failure() {
    let granularity = allocation_granularity();
    let mut arena = arena_with_segment(granularity * 2);

    let err = arena
        .create_view(granularity, granularity * 2, None)
        .expect_err("view past the end must fail");
    assert!(matches!(err, ArenaError::MappingFailure(_)));
    assert!(err.is_recoverable());

    let err = arena
        .create_view(1, granularity, None)
        .expect_err("unaligned offset must fail");
    assert!(matches!(err, ArenaError::MappingFailure(_)));

    let err = arena
        .create_view(0, 0, None)
        .expect_err("empty view must fail");
    assert!(matches!(err, ArenaError::MappingFailure(_)));

    arena.release_shm_segment().expect("release segment");
}

#[test]
fn hint_can_be_used_for_fixed_views_with_constant_offset_aliasing() {
    let granularity = allocation_granularity();
    let size = granularity * 4;
    let mut arena = arena_with_segment(size);

    let base = MemArena::reserve_address_space_hint(size * 2).expect("hint should be available");
    let low = arena.create_view(0, size, Some(base)).expect("view at hint");
    assert_eq!(low, base);

    let high_addr = NonNull::new(unsafe { base.as_ptr().add(size) }).expect("non-null");
    let high = arena
        .create_view(0, size, Some(high_addr))
        .expect("view right after the hint");
    assert_eq!(high, high_addr);

    write_byte(low, 0x10, 0x99);
    assert_eq!(read_byte(high, 0x10), 0x99);

    unsafe {
        arena.release_view(high, size).expect("release high");
        arena.release_view(low, size).expect("release low");
    }
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn fixed_view_never_replaces_an_existing_mapping() {
    let granularity = allocation_granularity();
    let mut arena = arena_with_segment(granularity);

    let occupied = arena.create_view(0, granularity, None).expect("first view");
    write_byte(occupied, 0, 0x11);
    let err = arena
        .create_view(0, granularity, Some(occupied))
        .expect_err("occupied address must be refused");
    assert!(matches!(err, ArenaError::MappingFailure(_)));
    assert_eq!(read_byte(occupied, 0), 0x11);

    unsafe { arena.release_view(occupied, granularity).expect("release") };
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn empty_hint_request_is_rejected() {
    let err = MemArena::reserve_address_space_hint(0).expect_err("empty probe must fail");
    assert!(matches!(err, ArenaError::AddressHintUnavailable(_)));
}

#[test]
fn layout_maps_mirrors_at_constant_offsets() {
    let granularity = allocation_granularity();
    let size = granularity * 2;
    let layout = ViewLayout::mirrored(size, 3).expect("three aliases should fit");
    let mut arena = arena_with_segment(layout.required_segment_size());

    let base = MemArena::reserve_address_space_hint(layout.address_space_span()).ok();
    let mapped = arena.map_layout(&layout, base).expect("layout should map");
    assert_eq!(mapped.views().len(), 3);
    assert_eq!(mapped.base(), base);

    let first = mapped.view("alias0").expect("alias0").address;
    write_byte(first, 5, 0x77);
    for view in mapped.views() {
        assert_eq!(read_byte(view.address, 5), 0x77, "view {}", view.name);
        if let (Some(base), false) = (base, view.relocated) {
            let expected = base.as_ptr() as usize
                + layout
                    .views()
                    .iter()
                    .find(|spec| spec.name == view.name)
                    .expect("layout should describe every mapped view")
                    .base_offset;
            assert_eq!(view.address.as_ptr() as usize, expected);
        }
    }

    unsafe { arena.unmap_layout(mapped).expect("unmap layout") };
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn layout_relocates_views_whose_fixed_placement_is_taken() {
    let granularity = allocation_granularity();
    let layout = ViewLayout::new().with_view(ViewSpec::new("ram", 0, granularity, 0));
    let mut arena = arena_with_segment(granularity);

    let squatter = arena.create_view(0, granularity, None).expect("squatter view");
    let mapped = arena
        .map_layout(&layout, Some(squatter))
        .expect("layout should fall back");
    assert_eq!(mapped.relocated_count(), 1);
    let ram = mapped.view("ram").expect("ram view");
    assert!(ram.relocated);
    assert_ne!(ram.address, squatter);

    write_byte(squatter, 9, 0x31);
    assert_eq!(read_byte(ram.address, 9), 0x31);

    unsafe {
        arena.unmap_layout(mapped).expect("unmap layout");
        arena.release_view(squatter, granularity).expect("release squatter");
    }
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn layout_without_base_maps_everything_at_os_chosen_addresses() {
    let granularity = allocation_granularity();
    let layout = ViewLayout::mirrored(granularity, 2).expect("two aliases should fit");
    let mut arena = arena_with_segment(granularity);

    let mapped = arena.map_layout(&layout, None).expect("layout should map");
    assert_eq!(mapped.relocated_count(), 0);
    assert!(mapped.base().is_none());

    unsafe { arena.unmap_layout(mapped).expect("unmap layout") };
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn layout_past_segment_end_rolls_back() {
    let granularity = allocation_granularity();
    let layout = ViewLayout::new()
        .with_view(ViewSpec::new("ok", 0, granularity, 0))
        .with_view(ViewSpec::new("too-far", granularity, granularity, granularity));
    let mut arena = arena_with_segment(granularity);

    let err = arena
        .map_layout(&layout, None)
        .expect_err("second view exceeds the segment");
    assert!(matches!(err, ArenaError::MappingFailure(_)));
    arena.release_shm_segment().expect("release segment");
}

#[test]
fn dropping_an_arena_releases_its_segment() {
    let granularity = allocation_granularity();
    let arena = arena_with_segment(granularity);
    assert!(arena.has_segment());
    drop(arena);
}

#[test]
fn out_of_bounds_view_at_a_base_fails_without_relocating() {
    let granularity = allocation_granularity();
    let mut arena = arena_with_segment(granularity);
    let Ok(base) = MemArena::reserve_address_space_hint(granularity * 2) else {
        arena.release_shm_segment().expect("release segment");
        return;
    };

    let broken = ViewLayout::new()
        .with_view(ViewSpec::new("ok", 0, granularity, 0))
        .with_view(ViewSpec::new("too-far", granularity, granularity, granularity));
    let err = arena
        .map_layout(&broken, Some(base))
        .expect_err("second view exceeds the segment");
    let ArenaError::MappingFailure(reason) = &err else {
        panic!("expected a mapping failure, got {err:?}");
    };
    assert!(reason.contains("exceeds segment size"), "{reason}");

    // The rolled-back view left the base free for a fixed placement.
    let layout = ViewLayout::new().with_view(ViewSpec::new("ok", 0, granularity, 0));
    let mapped = arena.map_layout(&layout, Some(base)).expect("layout should map");
    let view = mapped.view("ok").expect("ok view");
    if !view.relocated {
        assert_eq!(view.address, base);
    }

    unsafe { arena.unmap_layout(mapped).expect("unmap layout") };
    arena.release_shm_segment().expect("release segment");
}
