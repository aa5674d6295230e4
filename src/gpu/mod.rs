pub mod allocator;
pub mod pci;
pub mod validator;

pub use allocator::{GpuResourceAllocator, Reservation};
pub use pci::PciAddress;
pub use validator::{GpuSummary, SharedGpuValidator};
