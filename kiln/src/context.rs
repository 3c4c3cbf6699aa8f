use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    Arena, ArenaCreateInfo, ClassCreateInfo, ClassFlags, ClassInfo, ClassRef, ElementType,
    MethodInfo, NativeRegistry, Object, ObjectRef, SharedArena, Value, VmError, VmResult,
    backend::{self, Compilation, Globals, ScriptError, ScriptValue, StructuredMethod},
};

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub enabled: bool,
    /// Interpreted invocations after which a method is handed to the
    /// backend.
    pub hot_method_threshold: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_method_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextCreateInfo {
    pub arena: ArenaCreateInfo,
    pub jit: JitConfig,
}

/// Language-level exceptions raised by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NullPointer,
    Arithmetic,
    ArrayIndexOutOfBounds,
    ArrayStore,
    ClassCast,
    NegativeArraySize,
    IllegalMonitorState,
    StackOverflow,
}

impl Fault {
    pub const ALL: [Fault; 8] = [
        Fault::NullPointer,
        Fault::Arithmetic,
        Fault::ArrayIndexOutOfBounds,
        Fault::ArrayStore,
        Fault::ClassCast,
        Fault::NegativeArraySize,
        Fault::IllegalMonitorState,
        Fault::StackOverflow,
    ];

    pub const fn class_name(self) -> &'static str {
        match self {
            Fault::NullPointer => "java/lang/NullPointerException",
            Fault::Arithmetic => "java/lang/ArithmeticException",
            Fault::ArrayIndexOutOfBounds => "java/lang/ArrayIndexOutOfBoundsException",
            Fault::ArrayStore => "java/lang/ArrayStoreException",
            Fault::ClassCast => "java/lang/ClassCastException",
            Fault::NegativeArraySize => "java/lang/NegativeArraySizeException",
            Fault::IllegalMonitorState => "java/lang/IllegalMonitorStateException",
            Fault::StackOverflow => "java/lang/StackOverflowError",
        }
    }

    const fn super_class_name(self) -> &'static str {
        match self {
            Fault::ArrayIndexOutOfBounds => "java/lang/IndexOutOfBoundsException",
            Fault::StackOverflow => "java/lang/Error",
            _ => "java/lang/RuntimeException",
        }
    }
}

/// Produces structured IR for methods that became hot. The structuring
/// pass itself lives outside the engine.
pub trait MethodLowering: Send + Sync {
    fn lower(&self, method: &MethodInfo) -> Option<StructuredMethod>;
}

/// Compiled units keyed by method identity.
#[derive(Default)]
pub struct CompiledMethods {
    units: RwLock<HashMap<String, Arc<Compilation>>>,
}

impl CompiledMethods {
    pub fn lookup(&self, method: &MethodInfo) -> Option<Arc<Compilation>> {
        self.units.read().get(method.impl_key()).cloned()
    }

    pub fn install(&self, method: &MethodInfo, unit: Compilation) -> Arc<Compilation> {
        let unit = Arc::new(unit);
        self.units
            .write()
            .insert(method.impl_key().to_string(), unit.clone());
        unit
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide state shared by every thread: the arena, natives, compiled
/// code and the classes the engine needs to raise its own exceptions.
pub struct Context {
    arena: SharedArena,
    natives: NativeRegistry,
    compiled: CompiledMethods,
    system_classes: HashMap<&'static str, ClassRef>,
    array_classes: RwLock<HashMap<String, ClassRef>>,
    globals: Globals,
    jit: JitConfig,
    lowering: RwLock<Option<Arc<dyn MethodLowering>>>,
}

const OBJECT: &str = "java/lang/Object";
const STRING: &str = "java/lang/String";

impl Context {
    pub fn new(info: &ContextCreateInfo) -> Arc<Self> {
        Arc::new(Self {
            arena: Arena::shared(&info.arena),
            natives: NativeRegistry::with_defaults(),
            compiled: CompiledMethods::default(),
            system_classes: system_classes(),
            array_classes: RwLock::new(HashMap::new()),
            globals: Globals::standard(),
            jit: info.jit,
            lowering: RwLock::new(None),
        })
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn compiled(&self) -> &CompiledMethods {
        &self.compiled
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn jit(&self) -> &JitConfig {
        &self.jit
    }

    pub fn system_class(&self, name: &str) -> Option<ClassRef> {
        self.system_classes.get(name).cloned()
    }

    pub fn object_class(&self) -> ClassRef {
        self.system_classes[OBJECT].clone()
    }

    pub fn new_string(&self, value: &str) -> ObjectRef {
        Object::new_string(&self.system_classes[STRING], value)
    }

    pub fn new_exception(&self, fault: Fault, message: Option<String>) -> ObjectRef {
        Object::new_throwable(&self.system_classes[fault.class_name()], message)
    }

    /// Build the exception for `fault` as an error ready to propagate.
    pub fn throw(&self, fault: Fault, message: Option<String>) -> VmError {
        VmError::Exception(self.new_exception(fault, message))
    }

    /// Array class with the given component type, created on first use.
    pub fn array_class(&self, element: &ElementType) -> ClassRef {
        let name = format!("[{}", element.descriptor());
        if let Some(class) = self.array_classes.read().get(&name) {
            return class.clone();
        }
        let mut classes = self.array_classes.write();
        classes
            .entry(name.clone())
            .or_insert_with(|| {
                let object = self.object_class();
                let class = ClassInfo::new(ClassCreateInfo {
                    name,
                    super_class: Some(object.clone()),
                    flags: ClassFlags::PUBLIC | ClassFlags::FINAL,
                    element: Some(element.clone()),
                    ..Default::default()
                });
                class.link(object.vtable(), HashMap::new());
                class
            })
            .clone()
    }

    pub fn set_lowering(&self, lowering: Arc<dyn MethodLowering>) {
        *self.lowering.write() = Some(lowering);
    }

    /// Install a unit compiled ahead of time.
    pub fn install_compilation(&self, method: &MethodInfo, unit: Compilation) -> Arc<Compilation> {
        log::debug!("installing {} for {method:?}", unit.global_name());
        self.compiled.install(method, unit)
    }

    /// Compiled unit for `method`, compiling it first if it just became hot.
    pub fn compiled_for(&self, method: &MethodInfo) -> Option<Arc<Compilation>> {
        if let Some(unit) = self.compiled.lookup(method) {
            return Some(unit);
        }
        let hot = self.jit.enabled
            && method.invocation_count() >= self.jit.hot_method_threshold
            && method.is_compilable();
        if !hot {
            return None;
        }
        let lowering = self.lowering.read().clone()?;

        let Some(structured) = lowering.lower(method) else {
            method.mark_not_compilable();
            return None;
        };
        match backend::generate(&structured, None) {
            Ok(unit) => {
                log::debug!(
                    "compiled hot method {method:?} after {} calls:\n{}",
                    method.invocation_count(),
                    unit.source()
                );
                Some(self.compiled.install(method, unit))
            }
            Err(err) => {
                log::warn!("compilation of {method:?} failed: {err}");
                method.mark_not_compilable();
                None
            }
        }
    }

    /// Call a compiled unit with interpreter values, converting arguments
    /// and the result across the boundary.
    pub fn call_compiled(
        &self,
        unit: &Arc<Compilation>,
        method: &MethodInfo,
        args: &[Value],
    ) -> VmResult<Option<Value>> {
        let (this, rest) = if method.is_static() {
            (ScriptValue::Undefined, args)
        } else {
            match args.split_first() {
                Some((receiver, rest)) => (ScriptValue::from_value(receiver), rest),
                None => return Err(VmError::NoFrame),
            }
        };
        let arguments: Vec<ScriptValue> = rest.iter().map(ScriptValue::from_value).collect();
        log::trace!("calling {} for {method:?}", unit.global_name());
        let result = match unit.invoke(&self.globals, this, &arguments) {
            Ok(result) => result,
            // host exceptions thrown by generated code unwind like any other
            Err(ScriptError::Thrown(ScriptValue::Host(Value::Reference(Some(exception))))) => {
                return Err(VmError::Exception(exception));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(result.to_value(method.return_kind())?)
    }
}

fn system_classes() -> HashMap<&'static str, ClassRef> {
    let mut classes = HashMap::new();
    let object = ClassInfo::new(ClassCreateInfo {
        name: OBJECT.into(),
        flags: ClassFlags::PUBLIC,
        ..Default::default()
    });
    classes.insert(OBJECT, object.clone());

    let mut define = |name: &'static str, super_name: &'static str| {
        let super_class = classes[super_name].clone();
        let class = ClassInfo::new(ClassCreateInfo {
            name: name.into(),
            super_class: Some(super_class),
            flags: ClassFlags::PUBLIC,
            ..Default::default()
        });
        classes.insert(name, class);
    };
    define(STRING, OBJECT);
    define("java/lang/Throwable", OBJECT);
    define("java/lang/Exception", "java/lang/Throwable");
    define("java/lang/Error", "java/lang/Throwable");
    define("java/lang/RuntimeException", "java/lang/Exception");
    define("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException");
    for fault in Fault::ALL {
        define(fault.class_name(), fault.super_class_name());
    }
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_classes_form_the_throwable_hierarchy() {
        let context = Context::new(&ContextCreateInfo::default());
        let runtime = context.system_class("java/lang/RuntimeException").unwrap();
        let throwable = context.system_class("java/lang/Throwable").unwrap();
        for fault in Fault::ALL {
            let ex = context.new_exception(fault, Some("boom".into()));
            assert!(ex.class.is_assignable_to(&throwable), "{fault:?}");
        }
        let npe = context.new_exception(Fault::NullPointer, None);
        assert!(npe.class.is_assignable_to(&runtime));
        let soe = context.new_exception(Fault::StackOverflow, None);
        assert!(!soe.class.is_assignable_to(&runtime));
    }

    #[test]
    fn array_classes_are_cached() {
        let context = Context::new(&ContextCreateInfo::default());
        let a = context.array_class(&ElementType::Int);
        let b = context.array_class(&ElementType::Int);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "[I");

        let strings = context.array_class(&ElementType::Reference(
            context.system_class("java/lang/String").unwrap(),
        ));
        assert_eq!(strings.name, "[Ljava/lang/String;");
        let nested = context.array_class(&ElementType::Reference(strings));
        assert_eq!(nested.name, "[[Ljava/lang/String;");
        assert!(nested.is_assignable_to(&context.object_class()));
    }
}
