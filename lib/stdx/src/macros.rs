//! Convenience macros.

/// Generates `From<u32> for I` and `From<I> for u32`/`usize` impls for a
/// `u32` index newtype.
#[macro_export]
macro_rules! impl_idx_from {
    ($ty:ident($raw: ident)) => {
        impl From<$raw> for $ty {
            #[inline(always)]
            fn from(it: $raw) -> $ty {
                $ty(it)
            }
        }

        impl From<$ty> for $raw {
            #[inline(always)]
            fn from(it: $ty) -> $raw {
                it.0
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(it: usize) -> $ty {
                ::std::debug_assert!(it < $raw::MAX as usize);
                $ty(it as $raw)
            }
        }

        impl From<$ty> for usize {
            #[inline(always)]
            fn from(it: $ty) -> usize {
                it.0 as usize
            }
        }
    };
}

/// Generates an implementation of the specified fmt trait.
///
/// # Example
///
/// ```rust,ignore
/// impl_fmt! {
///     Display match Test{
///         Test::Bar(i) => "bar {}", i;
///         Test::Foo => "foo";
///     }
/// }
/// ```
#[macro_export]
macro_rules! impl_fmt {
    (  $trait:ident  match $ty: ident{ $($variant: pat => $fmt:literal $(, $fmt_arg: expr)*;)*}) => {
        impl std::fmt::$trait for $ty{
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self{
                    $( $variant => write!(f, $fmt $(,$fmt_arg)*)),*
                }
            }
        }
    };
}

#[macro_export]
macro_rules! impl_display {
    ( $($args: tt)*) => {
        $crate::impl_fmt!(Display $($args)*);
    };
}

#[macro_export]
macro_rules! impl_debug {
    ( $($args: tt)*) => {
        $crate::impl_fmt!(Debug $($args)*);
    };
}

#[macro_export]
macro_rules! impl_debug_display {
    ( $($args: tt)*) => {
        $crate::impl_fmt!(Debug $($args)*);
        $crate::impl_fmt!(Display $($args)*);
    };
}
