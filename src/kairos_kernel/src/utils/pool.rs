//! Typed views of statically allocated object arrays.
use core::{fmt, marker::PhantomData, ops};

/// An index into a [`Pool`].
pub trait PoolIndex: Copy + Eq + fmt::Debug {
    fn from_usize(i: usize) -> Self;
    fn as_usize(self) -> usize;
}

/// Define an object identifier newtype.
macro_rules! define_id {
    (
        $( #[$meta:meta] )*
        pub struct $Name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $Name(usize);

        impl $Name {
            /// Construct an identifier from a zero-based index.
            #[inline]
            pub const fn new(index: usize) -> Self {
                Self(index)
            }

            /// Get the zero-based index.
            #[inline]
            pub const fn get(self) -> usize {
                self.0
            }
        }

        impl core::fmt::Debug for $Name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, concat!(stringify!($Name), "({})"), self.0)
            }
        }

        impl $crate::utils::PoolIndex for $Name {
            #[inline]
            fn from_usize(i: usize) -> Self {
                Self(i)
            }
            #[inline]
            fn as_usize(self) -> usize {
                self.0
            }
        }
    };
}

/// A borrowed array of kernel objects indexed by `I`.
pub struct Pool<'a, T, I> {
    items: &'a [T],
    _phantom: PhantomData<fn(I)>,
}

impl<T, I> Clone for Pool<'_, T, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, I> Copy for Pool<'_, T, I> {}

impl<'a, T, I: PoolIndex> Pool<'a, T, I> {
    pub const fn new(items: &'a [T]) -> Self {
        Self {
            items,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn get(&self, i: I) -> Option<&'a T> {
        self.items.get(i.as_usize())
    }

    pub fn ids(&self) -> impl Iterator<Item = I> + 'a
    where
        I: 'a,
    {
        (0..self.items.len()).map(I::from_usize)
    }
}

impl<T, I: PoolIndex> ops::Index<I> for Pool<'_, T, I> {
    type Output = T;

    #[inline]
    fn index(&self, i: I) -> &Self::Output {
        &self.items[i.as_usize()]
    }
}

impl<T, I> fmt::Debug for Pool<'_, T, I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pool(len = {})", self.items.len())
    }
}
