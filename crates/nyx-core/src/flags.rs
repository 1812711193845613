//! Backend-neutral flag vocabularies.
//!
//! Bit values follow the Vulkan enums they correspond to, so backends can
//! translate with a raw cast.

use bitflags::bitflags;

bitflags! {
    /// Memory property flags (`VkMemoryPropertyFlagBits`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryFlags: u32 {
        const DEVICE_LOCAL = 0x1;
        const HOST_VISIBLE = 0x2;
        const HOST_COHERENT = 0x4;
        const HOST_CACHED = 0x8;
        const LAZILY_ALLOCATED = 0x10;
        const PROTECTED = 0x20;
    }
}

impl MemoryFlags {
    /// Flags for memory the host can write without explicit flushes.
    pub const HOST_SHARED: Self = Self::HOST_VISIBLE.union(Self::HOST_COHERENT);

    pub const fn is_host_visible(self) -> bool {
        self.contains(Self::HOST_VISIBLE)
    }
}

bitflags! {
    /// Buffer usage flags (`VkBufferUsageFlagBits`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArrayFlags: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const UNIFORM_TEXEL = 0x4;
        const STORAGE_TEXEL = 0x8;
        const UNIFORM = 0x10;
        const STORAGE = 0x20;
        const INDEX = 0x40;
        const VERTEX = 0x80;
        const INDIRECT = 0x100;
        const DEVICE_ADDRESS = 0x20000;
    }
}

/// Buffer usage flags under their lower-level name.
pub type BufferFlags = ArrayFlags;

impl Default for ArrayFlags {
    fn default() -> Self {
        Self::TRANSFER_SRC | Self::TRANSFER_DST
    }
}

bitflags! {
    /// Image usage flags (`VkImageUsageFlagBits`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const SAMPLED = 0x4;
        const STORAGE = 0x8;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
        const INPUT_ATTACHMENT = 0x80;
    }
}

impl Default for ImageUsage {
    fn default() -> Self {
        Self::SAMPLED | Self::TRANSFER_SRC | Self::TRANSFER_DST
    }
}

bitflags! {
    /// What a queue family can execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 0x1;
        const COMPUTE = 0x2;
        const TRANSFER = 0x4;
        /// Not a Vulkan queue flag; set when the family can present.
        const PRESENT = 0x100;
    }
}

bitflags! {
    /// Shader stages a binding or push constant range is visible to
    /// (`VkShaderStageFlagBits`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 0x1;
        const TESSELLATION_CONTROL = 0x2;
        const TESSELLATION_EVALUATION = 0x4;
        const GEOMETRY = 0x8;
        const FRAGMENT = 0x10;
        const COMPUTE = 0x20;
        const ALL_GRAPHICS = 0x1F;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_flags_default_to_transfer() {
        let flags = ArrayFlags::default();
        assert!(flags.contains(ArrayFlags::TRANSFER_SRC));
        assert!(flags.contains(ArrayFlags::TRANSFER_DST));
        assert!(!flags.contains(ArrayFlags::STORAGE));
    }

    #[test]
    fn bit_values_match_vulkan() {
        assert_eq!(ArrayFlags::STORAGE.bits(), 0x20);
        assert_eq!(ArrayFlags::VERTEX.bits(), 0x80);
        assert_eq!(ArrayFlags::DEVICE_ADDRESS.bits(), 0x2_0000);
        assert_eq!(MemoryFlags::HOST_COHERENT.bits(), 0x4);
        assert_eq!(ImageUsage::COLOR_ATTACHMENT.bits(), 0x10);
    }

    #[test]
    fn host_shared_is_visible_and_coherent() {
        assert!(MemoryFlags::HOST_SHARED.is_host_visible());
        assert!(MemoryFlags::HOST_SHARED.contains(MemoryFlags::HOST_COHERENT));
        assert!(!MemoryFlags::DEVICE_LOCAL.is_host_visible());
    }
}
