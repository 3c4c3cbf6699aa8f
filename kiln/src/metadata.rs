use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{ClassRef, Kind, MethodDescriptor, ObjectRef, Value, VmError, VmResult, kind};

pub type MethodRef = Arc<MethodInfo>;
pub type FieldRef = Arc<FieldInfo>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
    }
}

/// Entry of a method's exception table. `catch_type` of `None` catches
/// everything (`finally`).
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pub start_pc: usize,
    pub end_pc: usize,
    pub handler_pc: usize,
    pub catch_type: Option<ClassRef>,
}

impl ExceptionHandler {
    pub fn covers(&self, pc: usize) -> bool {
        self.start_pc <= pc && pc < self.end_pc
    }
}

#[derive(Debug, Default)]
pub struct MethodCreateInfo {
    pub name: String,
    pub signature: String,
    pub flags: MethodFlags,
    pub code: Vec<u8>,
    /// Local variable slots including arguments (and the receiver).
    pub max_locals: usize,
    pub max_stack: usize,
    pub vtable_index: Option<u16>,
    pub exception_handlers: Vec<ExceptionHandler>,
}

pub struct MethodInfo {
    pub name: String,
    pub signature: String,
    pub class: ClassRef,
    pub flags: MethodFlags,
    pub code: Vec<u8>,
    pub max_locals: usize,
    pub max_stack: usize,
    pub descriptor: MethodDescriptor,
    pub vtable_index: Option<u16>,
    pub exception_handlers: Vec<ExceptionHandler>,
    argument_slots: usize,
    consume_argument_slots: usize,
    /// `class.name.signature`, built once.
    key: String,
    invocations: AtomicU32,
    not_compilable: AtomicBool,
}

impl MethodInfo {
    pub fn new(class: &ClassRef, info: MethodCreateInfo) -> VmResult<MethodRef> {
        let descriptor = kind::parse_method_descriptor(&info.signature)?;
        let argument_slots = descriptor.argument_slots();
        let is_static = info.flags.contains(MethodFlags::STATIC);
        let consume_argument_slots = argument_slots + usize::from(!is_static);

        let bytecoded = !info
            .flags
            .intersects(MethodFlags::NATIVE | MethodFlags::ABSTRACT);
        if bytecoded && info.max_locals < consume_argument_slots {
            return Err(VmError::LocalsTooSmall {
                method: format!("{}.{}{}", class.name, info.name, info.signature),
                max_locals: info.max_locals,
                arguments: consume_argument_slots,
            });
        }

        let key = format!("{}.{}.{}", class.name, info.name, info.signature);
        Ok(Arc::new(Self {
            key,
            name: info.name,
            signature: info.signature,
            class: class.clone(),
            flags: info.flags,
            code: info.code,
            max_locals: info.max_locals.max(consume_argument_slots),
            max_stack: info.max_stack,
            descriptor,
            vtable_index: info.vtable_index,
            exception_handlers: info.exception_handlers,
            argument_slots,
            consume_argument_slots,
            invocations: AtomicU32::new(0),
            not_compilable: AtomicBool::new(false),
        }))
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// Argument slots excluding the receiver.
    pub fn argument_slots(&self) -> usize {
        self.argument_slots
    }

    /// Argument slots including the receiver of instance methods.
    pub fn consume_argument_slots(&self) -> usize {
        self.consume_argument_slots
    }

    pub fn return_kind(&self) -> Kind {
        self.descriptor.return_kind
    }

    /// `class.name.signature`, the key used by the native and compiled
    /// method tables.
    pub fn impl_key(&self) -> &str {
        &self.key
    }

    /// Bump and return the interpreter invocation count.
    pub fn record_invocation(&self) -> u32 {
        self.invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn is_compilable(&self) -> bool {
        !self.not_compilable.load(Ordering::Relaxed)
    }

    pub fn mark_not_compilable(&self) {
        self.not_compilable.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.impl_key())
    }
}

pub struct FieldInfo {
    pub name: String,
    pub class: ClassRef,
    pub kind: Kind,
    /// Index into the instance field layout; unused for statics.
    pub slot: usize,
    static_value: Option<Mutex<Value>>,
}

impl FieldInfo {
    pub fn new_instance(class: &ClassRef, name: &str, kind: Kind, slot: usize) -> FieldRef {
        Arc::new(Self {
            name: name.to_string(),
            class: class.clone(),
            kind,
            slot,
            static_value: None,
        })
    }

    pub fn new_static(class: &ClassRef, name: &str, kind: Kind) -> FieldRef {
        Arc::new(Self {
            name: name.to_string(),
            class: class.clone(),
            kind,
            slot: 0,
            static_value: Some(Mutex::new(Value::default_for(kind))),
        })
    }

    pub fn is_static(&self) -> bool {
        self.static_value.is_some()
    }

    pub fn get(&self, obj: &ObjectRef) -> VmResult<Value> {
        obj.field(self.slot)
    }

    pub fn set(&self, obj: &ObjectRef, value: Value) -> VmResult<()> {
        obj.set_field(self.slot, value.narrow(self.kind))
    }

    pub fn get_static(&self) -> VmResult<Value> {
        Ok(self.static_cell()?.lock().clone())
    }

    pub fn set_static(&self, value: Value) -> VmResult<()> {
        *self.static_cell()?.lock() = value.narrow(self.kind);
        Ok(())
    }

    fn static_cell(&self) -> VmResult<&Mutex<Value>> {
        self.static_value.as_ref().ok_or_else(|| VmError::TypeMismatch {
            expected: "static field",
            got: format!("{}.{}", self.class.name, self.name),
        })
    }
}

impl std::fmt::Debug for FieldInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{:?}", self.class.name, self.name, self.kind)
    }
}

/// Expected tag of a loadable constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantTag {
    Any,
    Integer,
    Float,
    Long,
    Double,
    String,
    Class,
}

/// Symbolic-reference resolution for one class. Class initialisation, if
/// any, happens inside the resolver.
pub trait ConstantPool: Send + Sync {
    fn resolve(&self, index: u16, tag: ConstantTag, is_static: bool) -> VmResult<Value>;
    fn resolve_field(&self, index: u16, is_static: bool) -> VmResult<FieldRef>;
    fn resolve_method(&self, index: u16, is_static: bool) -> VmResult<MethodRef>;
    fn resolve_class(&self, index: u16) -> VmResult<ClassRef>;
}

#[derive(Debug, Clone)]
pub enum PoolEntry {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(ObjectRef),
    Class(ClassRef),
    Field(FieldRef),
    Method(MethodRef),
}

/// A pool whose entries are resolved up front.
///
/// Methods are frequently defined after the pool that references them (a
/// method referencing itself, mutual recursion), so entries can be appended
/// or replaced after the pool is attached to its class.
#[derive(Debug, Default)]
pub struct StaticConstantPool {
    entries: Mutex<Vec<Option<PoolEntry>>>,
}

impl StaticConstantPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an entry and return its index.
    pub fn add(&self, entry: PoolEntry) -> u16 {
        let mut entries = self.entries.lock();
        entries.push(Some(entry));
        (entries.len() - 1) as u16
    }

    /// Reserve an index to be filled in later with [`Self::set`].
    pub fn reserve(&self) -> u16 {
        let mut entries = self.entries.lock();
        entries.push(None);
        (entries.len() - 1) as u16
    }

    pub fn set(&self, index: u16, entry: PoolEntry) {
        let mut entries = self.entries.lock();
        if entries.len() <= index as usize {
            entries.resize(index as usize + 1, None);
        }
        entries[index as usize] = Some(entry);
    }

    fn entry(&self, index: u16, expected: ConstantTag) -> VmResult<PoolEntry> {
        self.entries
            .lock()
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or(VmError::ConstantPool { index, expected })
    }
}

impl ConstantPool for StaticConstantPool {
    fn resolve(&self, index: u16, tag: ConstantTag, _is_static: bool) -> VmResult<Value> {
        let mismatch = VmError::ConstantPool {
            index,
            expected: tag,
        };
        let value = match (self.entry(index, tag)?, tag) {
            (PoolEntry::Integer(v), ConstantTag::Any | ConstantTag::Integer) => Value::Int(v),
            (PoolEntry::Float(v), ConstantTag::Any | ConstantTag::Float) => Value::Float(v),
            (PoolEntry::Long(v), ConstantTag::Any | ConstantTag::Long) => Value::Long(v),
            (PoolEntry::Double(v), ConstantTag::Any | ConstantTag::Double) => Value::Double(v),
            (PoolEntry::String(s), ConstantTag::Any | ConstantTag::String) => Value::from(s),
            _ => return Err(mismatch),
        };
        Ok(value)
    }

    fn resolve_field(&self, index: u16, is_static: bool) -> VmResult<FieldRef> {
        match self.entry(index, ConstantTag::Any)? {
            PoolEntry::Field(f) if f.is_static() == is_static => Ok(f),
            _ => Err(VmError::ConstantPool {
                index,
                expected: ConstantTag::Any,
            }),
        }
    }

    fn resolve_method(&self, index: u16, is_static: bool) -> VmResult<MethodRef> {
        match self.entry(index, ConstantTag::Any)? {
            PoolEntry::Method(m) if m.is_static() == is_static => Ok(m),
            _ => Err(VmError::ConstantPool {
                index,
                expected: ConstantTag::Any,
            }),
        }
    }

    fn resolve_class(&self, index: u16) -> VmResult<ClassRef> {
        match self.entry(index, ConstantTag::Class)? {
            PoolEntry::Class(c) => Ok(c),
            _ => Err(VmError::ConstantPool {
                index,
                expected: ConstantTag::Class,
            }),
        }
    }
}
