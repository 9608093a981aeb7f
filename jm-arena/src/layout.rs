use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::{ArenaError, ArenaResult, MemArena};

/// One view of the backing segment placed at `base + base_offset`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewSpec {
    pub name: String,
    pub segment_offset: usize,
    pub size: usize,
    pub base_offset: usize,
}

impl ViewSpec {
    pub fn new(name: impl Into<String>, segment_offset: usize, size: usize, base_offset: usize) -> Self {
        Self {
            name: name.into(),
            segment_offset,
            size,
            base_offset,
        }
    }
}

/// Ordered set of aliasing views making up a guest address space.
///
/// How many aliases exist and where they sit is decided by the guest memory
/// map, not by the arena.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewLayout {
    views: Vec<ViewSpec>,
}

impl ViewLayout {
    pub fn new() -> Self {
        Self { views: Vec::new() }
    }

    /// `count` back-to-back aliases of the first `size` bytes of the segment.
    ///
    /// Fails when the aliases would not fit in the address space.
    pub fn mirrored(size: usize, count: usize) -> ArenaResult<Self> {
        let span = size.checked_mul(count).ok_or_else(|| {
            ArenaError::MappingFailure(format!(
                "{count} aliases of {size:#x} bytes overflow the address space"
            ))
        })?;
        let views = (0..count)
            .map(|index| ViewSpec::new(format!("alias{index}"), 0, size, index * size))
            .collect();
        debug!(count, span, "built mirrored layout");
        Ok(Self { views })
    }

    pub fn with_view(mut self, spec: ViewSpec) -> Self {
        self.views.push(spec);
        self
    }

    pub fn views(&self) -> &[ViewSpec] {
        &self.views
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Smallest segment that satisfies every view.
    pub fn required_segment_size(&self) -> usize {
        self.views
            .iter()
            .map(|spec| spec.segment_offset.saturating_add(spec.size))
            .max()
            .unwrap_or(0)
    }

    /// Address space needed to place every view at its base offset.
    pub fn address_space_span(&self) -> usize {
        self.views
            .iter()
            .map(|spec| spec.base_offset.saturating_add(spec.size))
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedView {
    pub name: String,
    pub address: NonNull<u8>,
    pub size: usize,
    pub segment_offset: usize,
    /// Placed at an OS-chosen address because the fixed placement failed.
    pub relocated: bool,
}

#[derive(Debug)]
pub struct MappedLayout {
    base: Option<NonNull<u8>>,
    views: Vec<MappedView>,
}

impl MappedLayout {
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    pub fn views(&self) -> &[MappedView] {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&MappedView> {
        self.views.iter().find(|view| view.name == name)
    }

    pub fn relocated_count(&self) -> usize {
        self.views.iter().filter(|view| view.relocated).count()
    }
}

impl MemArena {
    /// Maps every view of `layout`, placing each at `base + base_offset`.
    ///
    /// A view whose fixed placement fails (or every view, when `base` is
    /// `None`) is mapped at an OS-chosen address instead. Any other failure
    /// unmaps the views created so far.
    pub fn map_layout(
        &self,
        layout: &ViewLayout,
        base: Option<NonNull<u8>>,
    ) -> ArenaResult<MappedLayout> {
        let mut views: Vec<MappedView> = Vec::with_capacity(layout.views().len());
        for spec in layout.views() {
            match self.map_spec(spec, base) {
                Ok(view) => views.push(view),
                Err(err) => {
                    for view in views.iter().rev() {
                        // Nothing has run against these views yet.
                        if let Err(unmap_err) = unsafe { self.release_view(view.address, view.size) } {
                            warn!(view = %view.name, "rollback unmap failed: {unmap_err}");
                        }
                    }
                    return Err(err);
                }
            }
        }
        let mapped = MappedLayout { base, views };
        debug!(
            views = mapped.views.len(),
            relocated = mapped.relocated_count(),
            "mapped view layout"
        );
        Ok(mapped)
    }

    /// Releases every view of `layout` in reverse mapping order. All views are
    /// attempted; the first error is returned.
    ///
    /// # Safety
    ///
    /// No code may access any of the layout's views afterwards.
    pub unsafe fn unmap_layout(&self, layout: MappedLayout) -> ArenaResult<()> {
        let mut first_error = None;
        for view in layout.views.iter().rev() {
            if let Err(err) = unsafe { self.release_view(view.address, view.size) } {
                warn!(view = %view.name, "failed to release view: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn map_spec(&self, spec: &ViewSpec, base: Option<NonNull<u8>>) -> ArenaResult<MappedView> {
        // Only address failures are worth a relocated retry.
        self.check_view(spec.segment_offset, spec.size)?;
        let desired = base.and_then(|base| {
            let addr = (base.as_ptr() as usize).checked_add(spec.base_offset)?;
            NonNull::new(addr as *mut u8)
        });
        let (address, relocated) = match desired {
            Some(desired) => match self.create_view(spec.segment_offset, spec.size, Some(desired)) {
                Ok(address) => (address, false),
                Err(ArenaError::MappingFailure(reason)) => {
                    warn!(
                        view = %spec.name,
                        "fixed placement at {:p} failed ({reason}), relocating",
                        desired.as_ptr()
                    );
                    (self.create_view(spec.segment_offset, spec.size, None)?, true)
                }
                Err(err) => return Err(err),
            },
            None => (
                self.create_view(spec.segment_offset, spec.size, None)?,
                base.is_some(),
            ),
        };
        Ok(MappedView {
            name: spec.name.clone(),
            address,
            size: spec.size,
            segment_offset: spec.segment_offset,
            relocated,
        })
    }
}
