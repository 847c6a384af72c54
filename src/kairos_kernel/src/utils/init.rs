#![allow(clippy::declare_interior_mutable_const)]
use core::{cell::Cell, marker::PhantomData};

/// Types having a constant default value, usable in `static` initializers.
/// This is essentially a constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

macro_rules! impl_init {
    ( $( $ty:ty => $value:expr, )* ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    () => (),
}
