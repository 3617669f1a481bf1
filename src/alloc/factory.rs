//! Allocator factory: kind → boxed instance.

use super::{
    AllocatorKind, BufferAllocator, DecoderFrameAllocator, FramebufferAllocator, NormalAllocator,
};

/// Create an allocator of the given kind.
///
/// A framebuffer allocator made this way has no surface descriptors and can
/// only wrap memory injected later; workers with device surfaces use
/// [`super::AllocatorFacade::with_surfaces`] instead.
pub fn create(kind: AllocatorKind) -> Box<dyn BufferAllocator> {
    match kind {
        AllocatorKind::Normal => Box::new(NormalAllocator::new()),
        AllocatorKind::DecoderFrame => Box::new(DecoderFrameAllocator::new()),
        AllocatorKind::Framebuffer => Box::new(FramebufferAllocator::new(Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_dispatches_on_kind() {
        for kind in [
            AllocatorKind::Normal,
            AllocatorKind::DecoderFrame,
            AllocatorKind::Framebuffer,
        ] {
            let alloc = create(kind);
            assert_eq!(alloc.kind(), kind);
            assert_ne!(alloc.allocator_id(), 0);
        }
    }
}
