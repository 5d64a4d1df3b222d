use crate::config::TimeoutAnnotation;
use std::sync::Arc;

/// A test class as seen by the host framework: a name, an optional timeout
/// annotation and the class it is nested in, if any.
#[derive(Clone, Debug)]
pub struct ClassInfo {
    name: String,
    annotation: Option<TimeoutAnnotation>,
    enclosing: Option<Arc<ClassInfo>>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: None,
            enclosing: None,
        }
    }

    pub fn annotated(mut self, annotation: TimeoutAnnotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn nested_in(mut self, enclosing: Arc<ClassInfo>) -> Self {
        self.enclosing = Some(enclosing);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The annotation declared directly on this class.
    pub fn annotation(&self) -> Option<TimeoutAnnotation> {
        self.annotation
    }

    pub fn enclosing(&self) -> Option<&ClassInfo> {
        self.enclosing.as_deref()
    }

    /// Finds the annotation on this class, or on the closest enclosing class that has one.
    pub fn find_annotation(&self) -> Option<TimeoutAnnotation> {
        let mut class = Some(self);
        while let Some(current) = class {
            if current.annotation.is_some() {
                return current.annotation;
            }
            class = current.enclosing();
        }
        None
    }
}

/// The method (or lifecycle step) being invoked.
#[derive(Clone, Debug)]
pub struct MethodInfo {
    name: String,
    annotation: Option<TimeoutAnnotation>,
    declaring_class: Option<Arc<ClassInfo>>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: None,
            declaring_class: None,
        }
    }

    pub fn annotated(mut self, annotation: TimeoutAnnotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn declared_in(mut self, class: Arc<ClassInfo>) -> Self {
        self.declaring_class = Some(class);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn annotation(&self) -> Option<TimeoutAnnotation> {
        self.annotation
    }

    pub fn declaring_class(&self) -> Option<&Arc<ClassInfo>> {
        self.declaring_class.as_ref()
    }
}

/// Reflective metadata handed to every interception hook.
#[derive(Clone, Debug)]
pub struct InvocationContext {
    method: MethodInfo,
    test_class: Option<Arc<ClassInfo>>,
}

impl InvocationContext {
    /// Context for `method` run against the class that declares it.
    pub fn new(method: MethodInfo) -> Self {
        let test_class = method.declaring_class.clone();
        Self { method, test_class }
    }

    /// Overrides the class under test, e.g. when the method is inherited.
    pub fn with_test_class(mut self, test_class: Arc<ClassInfo>) -> Self {
        self.test_class = Some(test_class);
        self
    }

    pub fn method(&self) -> &MethodInfo {
        &self.method
    }

    pub fn test_class(&self) -> Option<&ClassInfo> {
        self.test_class.as_deref()
    }
}

/// A single intercepted call. `proceed` runs the next step of the chain and
/// returns whatever it returns; a panic unwinds through it unchanged.
pub trait Invocation<T> {
    fn proceed(self) -> T;
}

impl<T, F> Invocation<T> for F
where
    F: FnOnce() -> T,
{
    fn proceed(self) -> T {
        self()
    }
}
