use std::any::{Any, TypeId};
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// Type-erased value travelling along graph links.
pub type Value = Box<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueUsage {
    Used,
    #[default]
    Maybe,
    Unused,
}

/// Runtime type descriptor of the values flowing through a socket.
#[derive(Clone, Copy)]
pub struct ValueType {
    name: &'static str,
    type_id: TypeId,
    copy_fn: fn(&(dyn Any + Send + Sync)) -> Value,
    default_fn: fn() -> Value,
    debug_fn: fn(&(dyn Any + Send + Sync)) -> String,
}

impl ValueType {
    pub fn of<T>() -> ValueType
    where
        T: Any + Clone + Default + Debug + Send + Sync,
    {
        ValueType {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            copy_fn: |value| {
                let value = value
                    .downcast_ref::<T>()
                    .unwrap_or_else(|| panic!("Value is not a {}", std::any::type_name::<T>()));
                Box::new(value.clone())
            },
            default_fn: || Box::new(T::default()),
            debug_fn: |value| {
                value
                    .downcast_ref::<T>()
                    .map_or_else(|| "<invalid>".to_string(), |value| format!("{value:?}"))
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn matches(&self, value: &Value) -> bool {
        (**value).type_id() == self.type_id
    }

    pub fn copy_value(&self, value: &Value) -> Value {
        debug_assert!(self.matches(value), "Value is not a {}", self.name);
        (self.copy_fn)(&**value)
    }

    pub fn default_value(&self) -> Value {
        (self.default_fn)()
    }

    pub fn format_value(&self, value: &Value) -> String {
        (self.debug_fn)(&**value)
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ValueType {}

impl Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}
