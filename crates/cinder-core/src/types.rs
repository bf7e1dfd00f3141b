//! # Cinder Core Types
//!
//! Fundamental type definitions used across the submission stack.
//!
//! These types provide:
//! - Strong typing for device addresses and sizes
//! - Typed handles for allocations and dependency nodes
//! - The ordering counters (task count, task level, flush stamp)

use core::fmt;
use core::ops::Sub;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the device's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(pub u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low 32 bits (for split address dwords)
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits (for split address dwords)
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB (page)
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as usize (host-side buffer lengths)
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a device resource
///
/// Handles are type-safe wrappers that prevent mixing different resource types.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

// Manual impls: derives would bound `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:x})", short, self.id)
    }
}

// Marker types for handles
/// Marker for graphics allocation handle
#[derive(Debug)]
pub struct AllocationMarker;
/// Marker for device handle
#[derive(Debug)]
pub struct DeviceMarker;
/// Marker for command queue handle
#[derive(Debug)]
pub struct QueueMarker;

/// Handle to a graphics allocation
pub type AllocationId = Handle<AllocationMarker>;
/// Handle to a device
pub type DeviceId = Handle<DeviceMarker>;
/// Handle to a command queue
pub type QueueId = Handle<QueueMarker>;

// =============================================================================
// ORDERING COUNTERS
// =============================================================================

/// Monotonic submission index assigned by a command stream receiver
pub type TaskCount = u32;

/// Dependency depth requested by the caller of a flush
pub type TaskLevel = u32;

/// Engine-specific marker returned by a hardware submission
pub type FlushStamp = u64;

/// Reserved task level: the producing command has not been submitted yet.
///
/// Flushing with a task level at or above this value is fatal.
pub const TASK_LEVEL_NOT_READY: TaskLevel = 0xFFFF_FFF0;

/// Task count marking an allocation that was never made resident
pub const OBJECT_NOT_USED: TaskCount = TaskCount::MAX;

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(AllocationId: Send, Sync, Copy);
static_assertions::const_assert!(TASK_LEVEL_NOT_READY < OBJECT_NOT_USED);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_gpu_addr_split() {
        let addr = GpuAddr::new(0x1000);
        assert_eq!(addr.offset(0x40) - addr, 0x40);
        assert_eq!(GpuAddr::new(0x1_2345_6789).high(), 1);
        assert_eq!(GpuAddr::new(0x1_2345_6789).low(), 0x2345_6789);
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(format!("{}", ByteSize::from_kib(64)), "64 KiB");
        assert_eq!(format!("{}", ByteSize::from_bytes(12)), "12 B");
        assert_eq!(ByteSize::from_bytes(100).align_up(64).as_bytes(), 128);
    }

    #[test]
    fn test_handle_ordering() {
        let a = AllocationId::new(1);
        let b = AllocationId::new(2);
        assert!(a < b);
        assert!(AllocationId::null().is_null());
        assert_eq!(format!("{:?}", a), "Handle<AllocationMarker>(0x1)");
    }
}
