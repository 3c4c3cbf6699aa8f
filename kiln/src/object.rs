use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::{ConstantPool, Kind, MethodRef, ThreadId, Value, VmError, VmResult};

pub type ClassRef = Arc<ClassInfo>;
pub type ObjectRef = Arc<Object>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClassFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

/// Component type of an array class.
#[derive(Debug, Clone)]
pub enum ElementType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference(ClassRef),
}

impl ElementType {
    /// Element type for a `NEWARRAY` type code.
    pub fn from_array_type(code: u8) -> Option<ElementType> {
        Some(match code {
            4 => ElementType::Boolean,
            5 => ElementType::Char,
            6 => ElementType::Float,
            7 => ElementType::Double,
            8 => ElementType::Byte,
            9 => ElementType::Short,
            10 => ElementType::Int,
            11 => ElementType::Long,
            _ => return None,
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            ElementType::Boolean => Kind::Boolean,
            ElementType::Byte => Kind::Byte,
            ElementType::Char => Kind::Char,
            ElementType::Short => Kind::Short,
            ElementType::Int => Kind::Int,
            ElementType::Float => Kind::Float,
            ElementType::Long => Kind::Long,
            ElementType::Double => Kind::Double,
            ElementType::Reference(_) => Kind::Reference,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            ElementType::Boolean => "Z".into(),
            ElementType::Byte => "B".into(),
            ElementType::Char => "C".into(),
            ElementType::Short => "S".into(),
            ElementType::Int => "I".into(),
            ElementType::Float => "F".into(),
            ElementType::Long => "J".into(),
            ElementType::Double => "D".into(),
            ElementType::Reference(class) if class.is_array() => class.name.clone(),
            ElementType::Reference(class) => format!("L{};", class.name),
        }
    }
}

/// Reentrant monitor state. Ownership is tracked by thread id only; a
/// contended enter reports failure and the caller decides to suspend.
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl Monitor {
    pub fn try_enter(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(thread);
                state.depth = 1;
                true
            }
            Some(owner) if owner == thread => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Returns `false` if `thread` does not own the monitor.
    pub fn exit(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
        }
        true
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}

/// Something a thread can hold a monitor on.
#[derive(Debug, Clone)]
pub enum LockTarget {
    Object(ObjectRef),
    Class(ClassRef),
}

impl LockTarget {
    pub fn monitor(&self) -> &Monitor {
        match self {
            LockTarget::Object(obj) => &obj.monitor,
            LockTarget::Class(class) => &class.monitor,
        }
    }
}

/// `(name, signature)` pair used for interface dispatch.
pub type MethodKey = (String, String);

#[derive(Debug, Default)]
pub struct ClassCreateInfo {
    pub name: String,
    pub super_class: Option<ClassRef>,
    pub interfaces: Vec<ClassRef>,
    pub flags: ClassFlags,
    /// Kinds of every instance field, inherited ones first.
    pub instance_fields: Vec<Kind>,
    pub element: Option<ElementType>,
}

pub struct ClassInfo {
    pub name: String,
    pub super_class: Option<ClassRef>,
    pub interfaces: Vec<ClassRef>,
    pub flags: ClassFlags,
    pub instance_fields: Vec<Kind>,
    pub element: Option<ElementType>,
    constant_pool: OnceLock<Arc<dyn ConstantPool>>,
    vtable: RwLock<Vec<MethodRef>>,
    interface_methods: RwLock<HashMap<MethodKey, MethodRef>>,
    monitor: Monitor,
}

impl ClassInfo {
    pub fn new(info: ClassCreateInfo) -> ClassRef {
        Arc::new(Self {
            name: info.name,
            super_class: info.super_class,
            interfaces: info.interfaces,
            flags: info.flags,
            instance_fields: info.instance_fields,
            element: info.element,
            constant_pool: OnceLock::new(),
            vtable: RwLock::new(Vec::new()),
            interface_methods: RwLock::new(HashMap::new()),
            monitor: Monitor::default(),
        })
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(ClassFlags::INTERFACE)
    }

    pub fn is_array(&self) -> bool {
        self.element.is_some()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Attach the constant pool. Only the first call has an effect.
    pub fn set_constant_pool(&self, pool: Arc<dyn ConstantPool>) {
        let _ = self.constant_pool.set(pool);
    }

    pub fn constant_pool(&self) -> VmResult<&Arc<dyn ConstantPool>> {
        self.constant_pool
            .get()
            .ok_or_else(|| VmError::MissingConstantPool(self.name.clone()))
    }

    /// Install dispatch tables. Subclasses usually start from a copy of
    /// their super class's vtable and replace the slots they override.
    pub fn link(&self, vtable: Vec<MethodRef>, interface_methods: HashMap<MethodKey, MethodRef>) {
        *self.vtable.write() = vtable;
        *self.interface_methods.write() = interface_methods;
    }

    pub fn vtable(&self) -> Vec<MethodRef> {
        self.vtable.read().clone()
    }

    pub fn virtual_method(&self, slot: u16) -> Option<MethodRef> {
        self.vtable.read().get(slot as usize).cloned()
    }

    pub fn interface_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        let key = (name.to_string(), signature.to_string());
        if let Some(method) = self.interface_methods.read().get(&key) {
            return Some(method.clone());
        }
        self.super_class
            .as_ref()
            .and_then(|s| s.interface_method(name, signature))
    }

    pub fn is_subclass_of(&self, other: &ClassInfo) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if std::ptr::eq(class, other) {
                return true;
            }
            current = class.super_class.as_deref();
        }
        false
    }

    pub fn implements(&self, interface: &ClassInfo) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            for i in &class.interfaces {
                if std::ptr::eq(i.as_ref(), interface) || i.implements(interface) {
                    return true;
                }
            }
            current = class.super_class.as_deref();
        }
        false
    }

    /// Whether a value of class `self` may be stored where `target` is
    /// expected.
    pub fn is_assignable_to(&self, target: &ClassInfo) -> bool {
        if std::ptr::eq(self, target) {
            return true;
        }
        match (&self.element, &target.element) {
            (Some(from), Some(to)) => match (from, to) {
                (ElementType::Reference(from), ElementType::Reference(to)) => {
                    from.is_assignable_to(to)
                }
                (from, to) => from.kind() == to.kind(),
            },
            // arrays are Objects; interfaces like Cloneable are not modelled
            (Some(_), None) => target.super_class.is_none() && !target.is_interface(),
            (None, Some(_)) => false,
            (None, None) => {
                if target.is_interface() {
                    self.implements(target)
                } else {
                    self.is_subclass_of(target)
                }
            }
        }
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ArrayData {
    Boolean(Vec<i8>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Float(Vec<f32>),
    Long(Vec<i64>),
    Double(Vec<f64>),
    Reference(Vec<Option<ObjectRef>>),
}

impl ArrayData {
    pub fn new(element: &ElementType, length: usize) -> ArrayData {
        match element {
            ElementType::Boolean => ArrayData::Boolean(vec![0; length]),
            ElementType::Byte => ArrayData::Byte(vec![0; length]),
            ElementType::Char => ArrayData::Char(vec![0; length]),
            ElementType::Short => ArrayData::Short(vec![0; length]),
            ElementType::Int => ArrayData::Int(vec![0; length]),
            ElementType::Float => ArrayData::Float(vec![0.0; length]),
            ElementType::Long => ArrayData::Long(vec![0; length]),
            ElementType::Double => ArrayData::Double(vec![0.0; length]),
            ElementType::Reference(_) => ArrayData::Reference(vec![None; length]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Boolean(v) | ArrayData::Byte(v) => v.len(),
            ArrayData::Char(v) => v.len(),
            ArrayData::Short(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Long(v) => v.len(),
            ArrayData::Double(v) => v.len(),
            ArrayData::Reference(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, widened to its stack representation. The caller
    /// performs the bounds check.
    pub fn load(&self, index: usize) -> Value {
        match self {
            ArrayData::Boolean(v) | ArrayData::Byte(v) => Value::Int(v[index] as i32),
            ArrayData::Char(v) => Value::Int(v[index] as i32),
            ArrayData::Short(v) => Value::Int(v[index] as i32),
            ArrayData::Int(v) => Value::Int(v[index]),
            ArrayData::Float(v) => Value::Float(v[index]),
            ArrayData::Long(v) => Value::Long(v[index]),
            ArrayData::Double(v) => Value::Double(v[index]),
            ArrayData::Reference(v) => Value::Reference(v[index].clone()),
        }
    }

    pub fn store(&mut self, index: usize, value: Value) -> VmResult<()> {
        match self {
            ArrayData::Boolean(v) => v[index] = (value.as_int()? & 1) as i8,
            ArrayData::Byte(v) => v[index] = value.as_int()? as i8,
            ArrayData::Char(v) => v[index] = value.as_int()? as u16,
            ArrayData::Short(v) => v[index] = value.as_int()? as i16,
            ArrayData::Int(v) => v[index] = value.as_int()?,
            ArrayData::Float(v) => v[index] = value.as_float()?,
            ArrayData::Long(v) => v[index] = value.as_long()?,
            ArrayData::Double(v) => v[index] = value.as_double()?,
            ArrayData::Reference(v) => v[index] = value.as_reference()?.cloned(),
        }
        Ok(())
    }

    /// `System.arraycopy` semantics for overlapping ranges within one array.
    pub fn copy_within(&mut self, src: usize, dst: usize, length: usize) {
        match self {
            ArrayData::Boolean(v) | ArrayData::Byte(v) => v.copy_within(src..src + length, dst),
            ArrayData::Char(v) => v.copy_within(src..src + length, dst),
            ArrayData::Short(v) => v.copy_within(src..src + length, dst),
            ArrayData::Int(v) => v.copy_within(src..src + length, dst),
            ArrayData::Float(v) => v.copy_within(src..src + length, dst),
            ArrayData::Long(v) => v.copy_within(src..src + length, dst),
            ArrayData::Double(v) => v.copy_within(src..src + length, dst),
            ArrayData::Reference(v) => {
                let moved: Vec<_> = v[src..src + length].to_vec();
                v[dst..dst + length].clone_from_slice(&moved);
            }
        }
    }
}

#[derive(Debug)]
pub enum ObjectData {
    Instance(Vec<Value>),
    Array(ArrayData),
    String(String),
}

pub struct Object {
    pub class: ClassRef,
    data: Mutex<ObjectData>,
    /// Detail message of throwables.
    pub message: Option<String>,
    monitor: Monitor,
}

impl Object {
    fn with_data(class: ClassRef, data: ObjectData, message: Option<String>) -> ObjectRef {
        Arc::new(Self {
            class,
            data: Mutex::new(data),
            message,
            monitor: Monitor::default(),
        })
    }

    pub fn new_instance(class: &ClassRef) -> ObjectRef {
        let fields = class
            .instance_fields
            .iter()
            .map(|k| Value::default_for(*k))
            .collect();
        Self::with_data(class.clone(), ObjectData::Instance(fields), None)
    }

    pub fn new_throwable(class: &ClassRef, message: Option<String>) -> ObjectRef {
        let fields = class
            .instance_fields
            .iter()
            .map(|k| Value::default_for(*k))
            .collect();
        Self::with_data(class.clone(), ObjectData::Instance(fields), message)
    }

    /// `class` must be an array class.
    pub fn new_array(class: &ClassRef, length: usize) -> VmResult<ObjectRef> {
        let element = class.element.as_ref().ok_or_else(|| VmError::TypeMismatch {
            expected: "array class",
            got: class.name.clone(),
        })?;
        let data = ArrayData::new(element, length);
        Ok(Self::with_data(class.clone(), ObjectData::Array(data), None))
    }

    pub fn new_string(class: &ClassRef, value: impl Into<String>) -> ObjectRef {
        Self::with_data(class.clone(), ObjectData::String(value.into()), None)
    }

    pub fn data(&self) -> parking_lot::MutexGuard<'_, ObjectData> {
        self.data.lock()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn field(&self, slot: usize) -> VmResult<Value> {
        match &*self.data.lock() {
            ObjectData::Instance(fields) => fields.get(slot).cloned().ok_or_else(|| {
                VmError::TypeMismatch {
                    expected: "field slot",
                    got: format!("{slot} of {}", self.class.name),
                }
            }),
            _ => Err(VmError::TypeMismatch {
                expected: "instance",
                got: self.class.name.clone(),
            }),
        }
    }

    pub fn set_field(&self, slot: usize, value: Value) -> VmResult<()> {
        match &mut *self.data.lock() {
            ObjectData::Instance(fields) if slot < fields.len() => {
                fields[slot] = value;
                Ok(())
            }
            _ => Err(VmError::TypeMismatch {
                expected: "instance field",
                got: format!("{slot} of {}", self.class.name),
            }),
        }
    }

    pub fn array_length(&self) -> Option<usize> {
        match &*self.data.lock() {
            ObjectData::Array(array) => Some(array.len()),
            _ => None,
        }
    }

    pub fn string_value(&self) -> Option<String> {
        match &*self.data.lock() {
            ObjectData::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Identity hash, stable for the lifetime of the object.
    pub fn identity_hash(self: &Arc<Self>) -> i32 {
        let addr = Arc::as_ptr(self) as usize;
        ((addr >> 3) ^ (addr >> 35)) as i32
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, self.string_value()) {
            (_, Some(s)) => write!(f, "{s:?}"),
            (Some(message), None) => write!(f, "{}: {message}", self.class.name),
            (None, None) => match self.array_length() {
                Some(len) => write!(f, "{}[{len}]", self.class.name),
                None => write!(f, "{}", self.class.name),
            },
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
