// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! 32-bit physical and linear addresses.
//!
//! Both paging modes supported by this crate translate 32-bit linear addresses to 32-bit
//! physical addresses, so addresses and lengths are plain `u32`s regardless of the host
//! pointer width. Arithmetic that may run off the end of the address space is explicit:
//! either `checked_*` or `wrapping_*`.

use core::fmt;

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MAX: Self = Self(u32::MAX);
            pub const MIN: Self = Self(u32::MIN);
            pub const ZERO: Self = Self(0);

            #[must_use]
            pub const fn new(n: u32) -> Self {
                Self(n)
            }

            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }

            /// Adds `offset`, returning `None` on wrap-around.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, offset: u32) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(n) => Some(Self(n)),
                    None => None,
                }
            }

            /// Adds `offset`, panicking on wrap-around.
            #[inline]
            #[must_use]
            pub const fn add(self, offset: u32) -> Self {
                Self(self.0 + offset)
            }

            #[inline]
            #[must_use]
            pub const fn wrapping_add(self, offset: u32) -> Self {
                Self(self.0.wrapping_add(offset))
            }

            #[inline]
            #[must_use]
            pub const fn wrapping_sub(self, offset: u32) -> Self {
                Self(self.0.wrapping_sub(offset))
            }

            /// Distance in bytes from `origin` up to `self`, wrapping at the end of the
            /// address space.
            #[inline]
            #[must_use]
            pub const fn wrapping_offset_from(self, origin: Self) -> u32 {
                self.0.wrapping_sub(origin.0)
            }

            /// Distance in bytes from `origin` up to `self`.
            ///
            /// # Panics
            ///
            /// Panics if `self` is below `origin`.
            #[inline]
            #[must_use]
            pub const fn offset_from_unsigned(self, origin: Self) -> u32 {
                match self.0.checked_sub(origin.0) {
                    Some(n) => n,
                    None => panic!("attempt to subtract with overflow"),
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, align: u32) -> bool {
                assert!(align.is_power_of_two(), "is_aligned_to: align is not a power-of-two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u32) -> Self {
                assert!(align.is_power_of_two(), "align_down: align is not a power-of-two");
                Self(self.0 & !(align - 1))
            }

            /// Rounds up to `align`, returning `None` if that runs off the address space.
            #[inline]
            #[must_use]
            pub const fn checked_align_up(self, align: u32) -> Option<Self> {
                assert!(align.is_power_of_two(), "checked_align_up: align is not a power-of-two");
                match self.0.checked_add(align - 1) {
                    Some(n) => Some(Self(n & !(align - 1))),
                    None => None,
                }
            }
        }

        impl From<u32> for $address_ty {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<$address_ty> for u32 {
            fn from(value: $address_ty) -> Self {
                value.0
            }
        }

        impl fmt::Display for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($address_ty), "({:#010x})"), self.0)
            }
        }

        impl fmt::LowerHex for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// An address in physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(u32);
impl_address!(PhysicalAddress);

/// A linear (virtual) address, either in some process' address space or in the one
/// currently loaded on this CPU.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(u32);
impl_address!(VirtualAddress);

impl VirtualAddress {
    /// Pointer to this address in the address space the kernel is running in.
    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        core::ptr::with_exposed_provenance(self.0 as usize)
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.0 as usize)
    }
}

impl PhysicalAddress {
    /// Reinterprets a physical address as the linear address that maps it one-to-one, for
    /// physical ranges that are accessed through an identity window.
    #[inline]
    #[must_use]
    pub const fn identity(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }
}
