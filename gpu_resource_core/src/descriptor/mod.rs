mod descriptor_table;

pub use descriptor_table::{DescriptorHeapType, DescriptorSlotInfo, DescriptorTable};
