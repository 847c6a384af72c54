//! Result codes and error types
use core::fmt;

/// Define [`ResultCode`] along with its string conversion.
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use kairos_kernel::ResultCode;
            /// assert_eq!(ResultCode::WouldDeadlock.as_str(), "WouldDeadlock");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel operations can
    /// produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object identifier is out of range.
        BadId = -18,
        /// The current context disallows the operation (e.g., CPU Lock is
        /// already active).
        BadContext = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Resource deadlock would occur.
        WouldDeadlock = -30,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// The operation could not complete without blocking.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

/// Define an operation error type whose discriminants match [`ResultCode`].
macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        pub enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $( $name::$vname => Self::$vname, )*
                }
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname as i8,
                        $name::$vname as i8,
                    );
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

/// Define a single-purpose error type that converts into every listed
/// operation error.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:ident )] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        pub enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:ident )]
        $( #[into( $Supererror:ident )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Kernel::mutex_lock`].
    ///
    /// [`Kernel::mutex_lock`]: crate::Kernel::mutex_lock
    pub enum LockMutexError {
        /// The mutex ID is out of range.
        BadId,
        /// CPU Lock is active, or the current context is an interrupt
        /// context.
        BadContext,
        /// The current thread already owns the mutex (and recursive locking
        /// is disabled).
        WouldDeadlock,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Kernel::mutex_try_lock`].
    ///
    /// [`Kernel::mutex_try_lock`]: crate::Kernel::mutex_try_lock
    pub enum TryLockMutexError {
        BadId,
        BadContext,
        /// The mutex is owned by another thread.
        Timeout,
        /// The current thread already owns the mutex (and recursive locking
        /// is disabled).
        WouldDeadlock,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Kernel::mutex_unlock_checked`].
    ///
    /// [`Kernel::mutex_unlock_checked`]: crate::Kernel::mutex_unlock_checked
    pub enum UnlockMutexError {
        BadId,
        BadContext,
        /// The current thread does not own the mutex.
        NotOwner,
        /// The mutex is not the most recently locked one.
        BadObjectState,
    }
}

define_error! {
    mod unlock_all_mutexes_error {}
    /// Error type for [`Kernel::mutex_unlock_all`].
    ///
    /// [`Kernel::mutex_unlock_all`]: crate::Kernel::mutex_unlock_all
    pub enum UnlockAllMutexesError {
        BadContext,
    }
}

define_error! {
    mod manage_mutex_error {}
    /// Error type for [`Kernel::mutex_init`] and [`Kernel::mutex_dispose`].
    ///
    /// [`Kernel::mutex_init`]: crate::Kernel::mutex_init
    /// [`Kernel::mutex_dispose`]: crate::Kernel::mutex_dispose
    pub enum ManageMutexError {
        BadId,
        BadContext,
        /// The mutex is owned or has waiters.
        BadObjectState,
    }
}

define_error! {
    mod set_timer_error {}
    /// Error type for the operations arming a virtual timer.
    pub enum SetTimerError {
        BadId,
        BadContext,
        /// The delay is zero.
        BadParam,
    }
}

define_error! {
    mod reset_timer_error {}
    /// Error type for the operations disarming a virtual timer.
    pub enum ResetTimerError {
        BadId,
        BadContext,
    }
}

define_error! {
    mod query_error {}
    /// Error type for read-only queries on kernel objects.
    pub enum QueryError {
        BadId,
        BadContext,
    }
}

define_suberror! {
    /// `BadContext`
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(UnlockAllMutexesError)]
    #[into(ManageMutexError)]
    #[into(SetTimerError)]
    #[into(ResetTimerError)]
    #[into(QueryError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(ManageMutexError)]
    #[into(SetTimerError)]
    #[into(ResetTimerError)]
    #[into(QueryError)]
    pub enum BadIdError {
        BadId,
    }
}
