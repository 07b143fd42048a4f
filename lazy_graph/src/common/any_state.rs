use std::any::Any;

/// Node-private scratch memory, type-erased.
#[derive(Debug, Default)]
pub struct AnyState {
    boxed: Option<Box<dyn Any + Send>>,
}

impl AnyState {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send,
    {
        Self {
            boxed: Some(Box::new(value)),
        }
    }

    pub fn is_none(&self) -> bool {
        self.boxed.is_none()
    }

    pub fn is<T>(&self) -> bool
    where
        T: Any + Send,
    {
        self.boxed.as_ref().is_some_and(|boxed| boxed.is::<T>())
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Any + Send,
    {
        self.boxed
            .as_ref()
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Any + Send,
    {
        self.boxed
            .as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    pub fn take<T>(&mut self) -> Option<T>
    where
        T: Any + Send,
    {
        match self.boxed.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                self.boxed = Some(boxed);
                None
            }
        }
    }

    pub fn get_or_default<T>(&mut self) -> &mut T
    where
        T: Any + Send + Default,
    {
        if !self.is::<T>() {
            self.boxed = Some(Box::<T>::default());
        }

        self.get_mut::<T>()
            .expect("AnyState holds a value of the requested type")
    }
}
