// Host implementations of the bundled kernels, bound to MockCpu by entry
// point name.

pub mod add_op;
pub use add_op::add_assign_u32;
