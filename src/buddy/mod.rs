//! Buddy page allocator module
//!
//! Provides the page-frame descriptor table shared by every zone and the
//! per-zone binary buddy allocator that splits and coalesces power-of-two
//! blocks inside it.

pub mod allocator;
pub mod descriptor;

pub use allocator::BuddyAllocator;
pub use descriptor::{DescFlags, DescriptorTable, FrameDescriptor, NO_ZONE};
