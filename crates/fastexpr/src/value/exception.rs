//! Built-in exception classes.

use std::sync::OnceLock;

use crate::types::{ClassDef, ClassRef, Type};

/// Root of every throwable class. Field 0 is the message.
pub fn exception_class() -> &'static ClassRef {
    static CLASS: OnceLock<ClassRef> = OnceLock::new();
    CLASS.get_or_init(|| ClassDef::build("Exception").field("message", Type::Str).finish())
}

macro_rules! builtin_exceptions {
    ($($fn_name:ident => $class_name:literal),* $(,)?) => {
        /// Exceptions raised by the VM and the evaluator themselves.
        pub mod builtin {
            use std::sync::OnceLock;

            use crate::types::{ClassDef, ClassRef};

            $(
                pub fn $fn_name() -> &'static ClassRef {
                    static CLASS: OnceLock<ClassRef> = OnceLock::new();
                    CLASS.get_or_init(|| {
                        ClassDef::build($class_name)
                            .extends(super::exception_class())
                            .finish()
                    })
                }
            )*
        }
    };
}

builtin_exceptions! {
    null_reference => "NullReferenceException",
    divide_by_zero => "DivideByZeroException",
    overflow => "OverflowException",
    invalid_cast => "InvalidCastException",
    index_out_of_range => "IndexOutOfRangeException",
    invalid_operation => "InvalidOperationException",
}
