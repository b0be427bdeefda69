use crate::error::TargetError;
use crate::value::{FromValue, ObjectRef, Value};

/// What a stand-in can do to the value it wraps. Every intercepted
/// operation, local or replayed from the peer, ends up in one of these.
///
/// Implement it by hand, use [`impl_target!`](crate::impl_target) for plain
/// structs, or wrap an [`ObjectRef`] or a closure ([`CallableTarget`]).
pub trait Target {
    fn get(&self, name: &str) -> Result<Value, TargetError>;

    fn set(&mut self, name: &str, value: Value) -> Result<(), TargetError>;

    fn isset(&self, name: &str) -> bool;

    fn unset(&mut self, name: &str) -> Result<(), TargetError>;

    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, TargetError>;

    /// Calls the target itself. Only callable targets support this.
    fn invoke(&mut self, args: Vec<Value>) -> Result<Value, TargetError> {
        let _ = args;
        Err(TargetError::NotInvokable)
    }

    /// String conversion of the target.
    fn render(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }

    /// An independent deep copy.
    fn duplicate(&self) -> Self
    where
        Self: Sized;
}

impl Target for ObjectRef {
    fn get(&self, name: &str) -> Result<Value, TargetError> {
        ObjectRef::get(self, name).ok_or_else(|| TargetError::UnknownMember(name.to_owned()))
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), TargetError> {
        ObjectRef::set(self, name, value);
        Ok(())
    }

    /// Present and not absent.
    fn isset(&self, name: &str) -> bool {
        ObjectRef::get(self, name).map_or(false, |value| !value.is_absent())
    }

    fn unset(&mut self, name: &str) -> Result<(), TargetError> {
        self.remove(name);
        Ok(())
    }

    /// Methods of a dynamic object are its closure members.
    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, TargetError> {
        match ObjectRef::get(self, method) {
            Some(Value::Closure(closure)) => Ok(closure.call(&args)),
            _ => Err(TargetError::UnknownMethod(method.to_owned())),
        }
    }

    fn render(&self) -> String {
        match ObjectRef::get(self, "to_string") {
            Some(Value::Closure(closure)) => match closure.call(&[]) {
                Value::Str(s) => s,
                _ => self.class(),
            },
            _ => self.class(),
        }
    }

    fn duplicate(&self) -> Self {
        self.deep_copy()
    }
}

/// A target that is nothing but a function, for stand-ins of callables.
#[derive(Clone)]
pub struct CallableTarget<F> {
    f: F,
}

impl<F> CallableTarget<F>
where
    F: FnMut(Vec<Value>) -> Value + Clone,
{
    pub fn new(f: F) -> Self {
        CallableTarget { f }
    }
}

impl<F> Target for CallableTarget<F>
where
    F: FnMut(Vec<Value>) -> Value + Clone,
{
    fn get(&self, name: &str) -> Result<Value, TargetError> {
        Err(TargetError::UnknownMember(name.to_owned()))
    }

    fn set(&mut self, name: &str, _: Value) -> Result<(), TargetError> {
        Err(TargetError::UnknownMember(name.to_owned()))
    }

    fn isset(&self, _: &str) -> bool {
        false
    }

    fn unset(&mut self, _: &str) -> Result<(), TargetError> {
        Ok(())
    }

    fn call(&mut self, method: &str, _: Vec<Value>) -> Result<Value, TargetError> {
        Err(TargetError::UnknownMethod(method.to_owned()))
    }

    fn invoke(&mut self, args: Vec<Value>) -> Result<Value, TargetError> {
        Ok((self.f)(args))
    }

    fn render(&self) -> String {
        String::from("callable")
    }

    fn duplicate(&self) -> Self {
        self.clone()
    }
}

/// Pulls the next positional argument of `method` and converts it.
#[doc(hidden)]
pub fn next_arg<T, I>(args: &mut I, method: &str, position: &mut usize) -> Result<T, TargetError>
where
    T: FromValue,
    I: Iterator<Item = Value>,
{
    let value = args.next().ok_or_else(|| TargetError::MissingArgument {
        method: method.to_owned(),
        position: *position,
    })?;
    *position += 1;
    T::from_value(value)
}

/// Implements [`Target`](crate::sync::Target) for a struct from a list of
/// its mirrored fields and methods.
///
/// Fields must be `Clone + Default`, convertible into a
/// [`Value`](crate::value::Value) and extractable with
/// [`FromValue`](crate::value::FromValue); `unset` resets a field to its
/// default. Method arguments must implement `FromValue` and return types
/// `Into<Value>`. The struct itself must be `Clone`, which serves as
/// `duplicate`. An optional `invoke` line names the method that calling the
/// target runs, and `render` a `&self` method returning `String`.
///
/// ```
/// use forksync::impl_target;
///
/// #[derive(Clone, Default)]
/// struct Counter {
///     count: i64,
/// }
///
/// impl Counter {
///     fn add(&mut self, n: i64) -> i64 {
///         self.count += n;
///         self.count
///     }
/// }
///
/// impl_target! {
///     Counter {
///         fields { count: i64 }
///         methods { fn add(&mut self, n: i64) -> i64; }
///         invoke => add;
///     }
/// }
/// ```
#[macro_export]
macro_rules! impl_target {
    (
        $ty:ty {
            fields { $($field:ident : $fty:ty),* $(,)? }
            methods { $(fn $method:ident(&mut self $(, $arg:ident : $aty:ty)*) $(-> $ret:ty)?;)* }
            $(invoke => $invoke:ident;)?
            $(render => $render:ident;)?
        }
    ) => {
        impl $crate::sync::Target for $ty {
            fn get(&self, name: &str) -> ::std::result::Result<$crate::value::Value, $crate::error::TargetError> {
                $(
                    if name == stringify!($field) {
                        return Ok($crate::value::Value::from(self.$field.clone()));
                    }
                )*
                Err($crate::error::TargetError::UnknownMember(name.to_owned()))
            }

            fn set(
                &mut self,
                name: &str,
                value: $crate::value::Value,
            ) -> ::std::result::Result<(), $crate::error::TargetError> {
                $(
                    if name == stringify!($field) {
                        self.$field = <$fty as $crate::value::FromValue>::from_value(value)?;
                        return Ok(());
                    }
                )*
                let _ = value;
                Err($crate::error::TargetError::UnknownMember(name.to_owned()))
            }

            fn isset(&self, name: &str) -> bool {
                false $(|| name == stringify!($field))*
            }

            fn unset(&mut self, name: &str) -> ::std::result::Result<(), $crate::error::TargetError> {
                $(
                    if name == stringify!($field) {
                        self.$field = ::std::default::Default::default();
                        return Ok(());
                    }
                )*
                Err($crate::error::TargetError::UnknownMember(name.to_owned()))
            }

            #[allow(unused_mut, unused_variables)]
            fn call(
                &mut self,
                method: &str,
                args: ::std::vec::Vec<$crate::value::Value>,
            ) -> ::std::result::Result<$crate::value::Value, $crate::error::TargetError> {
                let mut args = args.into_iter();
                $(
                    if method == stringify!($method) {
                        let mut position = 0usize;
                        $(
                            let $arg: $aty = $crate::sync::next_arg(&mut args, method, &mut position)?;
                        )*
                        let ret $(: $ret)? = self.$method($($arg),*);
                        return Ok($crate::value::Value::from(ret));
                    }
                )*
                Err($crate::error::TargetError::UnknownMethod(method.to_owned()))
            }

            $(
                fn invoke(
                    &mut self,
                    args: ::std::vec::Vec<$crate::value::Value>,
                ) -> ::std::result::Result<$crate::value::Value, $crate::error::TargetError> {
                    $crate::sync::Target::call(self, stringify!($invoke), args)
                }
            )?

            $(
                fn render(&self) -> ::std::string::String {
                    self.$render()
                }
            )?

            fn duplicate(&self) -> Self {
                ::std::clone::Clone::clone(self)
            }
        }
    };
}
