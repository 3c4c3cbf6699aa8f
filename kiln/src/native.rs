use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;

use crate::{Context, Fault, MethodInfo, ObjectData, ObjectRef, Thread, Value, VmError, VmResult};

/// Host implementation of a `native` method. Receives the receiver (for
/// instance methods) followed by the declared arguments.
pub type NativeFn = Arc<dyn Fn(&mut Thread, &[Value]) -> VmResult<Option<Value>> + Send + Sync>;

/// Natives keyed by `class.name.signature`.
#[derive(Default)]
pub struct NativeRegistry {
    natives: RwLock<HashMap<String, NativeFn>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the numeric and `System` natives installed.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        install_defaults(&registry);
        registry
    }

    pub fn register<F>(&self, key: &str, native: F)
    where
        F: Fn(&mut Thread, &[Value]) -> VmResult<Option<Value>> + Send + Sync + 'static,
    {
        self.natives.write().insert(key.to_string(), Arc::new(native));
    }

    pub fn lookup(&self, key: &str) -> Option<NativeFn> {
        self.natives.read().get(key).cloned()
    }

    pub fn resolve(&self, method: &MethodInfo) -> VmResult<NativeFn> {
        let key = method.impl_key();
        self.lookup(key)
            .ok_or_else(|| VmError::UnboundNative(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.natives.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn math(registry: &NativeRegistry, name: &str, f: fn(f64) -> f64) {
    registry.register(&format!("java/lang/Math.{name}.(D)D"), move |_, args| {
        Ok(Some(Value::Double(f(args[0].as_double()?))))
    });
}

fn millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn install_defaults(registry: &NativeRegistry) {
    math(registry, "sqrt", f64::sqrt);
    math(registry, "sin", f64::sin);
    math(registry, "cos", f64::cos);
    math(registry, "tan", f64::tan);
    math(registry, "asin", f64::asin);
    math(registry, "acos", f64::acos);
    math(registry, "atan", f64::atan);
    math(registry, "floor", f64::floor);
    math(registry, "ceil", f64::ceil);

    registry.register("java/lang/Math.atan2.(DD)D", |_, args| {
        Ok(Some(Value::Double(args[0].as_double()?.atan2(args[1].as_double()?))))
    });

    registry.register("java/lang/Float.floatToIntBits.(F)I", |_, args| {
        let v = args[0].as_float()?;
        let bits = if v.is_nan() { 0x7fc0_0000 } else { v.to_bits() };
        Ok(Some(Value::Int(bits as i32)))
    });
    registry.register("java/lang/Float.intBitsToFloat.(I)F", |_, args| {
        Ok(Some(Value::Float(f32::from_bits(args[0].as_int()? as u32))))
    });
    registry.register("java/lang/Double.doubleToLongBits.(D)J", |_, args| {
        let v = args[0].as_double()?;
        let bits = if v.is_nan() {
            0x7ff8_0000_0000_0000
        } else {
            v.to_bits()
        };
        Ok(Some(Value::Long(bits as i64)))
    });
    registry.register("java/lang/Double.longBitsToDouble.(J)D", |_, args| {
        Ok(Some(Value::Double(f64::from_bits(args[0].as_long()? as u64))))
    });

    registry.register("java/lang/System.currentTimeMillis.()J", |_, _| {
        Ok(Some(Value::Long(millis())))
    });
    registry.register("com/sun/cldchi/jvm/JVM.monotonicTimeMillis.()J", |_, _| {
        Ok(Some(Value::Long(millis())))
    });
    registry.register(
        "java/lang/System.arraycopy.(Ljava/lang/Object;ILjava/lang/Object;II)V",
        array_copy,
    );
    for key in [
        "com/sun/cldchi/jvm/JVM.unchecked_char_arraycopy.([CI[CII)V",
        "com/sun/cldchi/jvm/JVM.unchecked_int_arraycopy.([II[III)V",
        "com/sun/cldchi/jvm/JVM.unchecked_obj_arraycopy.([Ljava/lang/Object;I[Ljava/lang/Object;II)V",
    ] {
        registry.register(key, unchecked_array_copy);
    }
    registry.register("java/lang/Object.hashCode.()I", |thread, args| {
        match args[0].as_reference()? {
            Some(obj) => Ok(Some(Value::Int(obj.identity_hash()))),
            None => Err(thread.context().throw(Fault::NullPointer, None)),
        }
    });
    registry.register("java/lang/Runtime.gc.()V", |_, _| Ok(None));
    registry.register("java/lang/Runtime.totalMemory.()J", |thread, _| {
        let total = thread.context().arena().lock().capacity();
        Ok(Some(Value::Long(total as i64)))
    });
    registry.register("java/lang/Runtime.freeMemory.()J", |thread, _| {
        let arena = thread.context().arena().lock();
        Ok(Some(Value::Long((arena.capacity() - arena.allocated()) as i64)))
    });
    registry.register("java/lang/Throwable.fillInStackTrace.()V", |_, _| Ok(None));
}

/// Checked operands of an `(src, srcPos, dst, dstPos, length)` copy.
struct CopyRange<'a> {
    src: &'a ObjectRef,
    src_pos: usize,
    dst: &'a ObjectRef,
    dst_pos: usize,
    length: usize,
}

impl<'a> CopyRange<'a> {
    fn new(context: &Context, args: &'a [Value]) -> VmResult<Self> {
        let (Some(src), Some(dst)) = (args[0].as_reference()?, args[2].as_reference()?) else {
            return Err(context.throw(Fault::NullPointer, None));
        };
        let (src_pos, dst_pos, length) =
            (args[1].as_int()?, args[3].as_int()?, args[4].as_int()?);

        let (Some(src_len), Some(dst_len)) = (src.array_length(), dst.array_length()) else {
            return Err(context.throw(Fault::ArrayStore, Some("not an array".into())));
        };
        let out_of_bounds = src_pos < 0
            || dst_pos < 0
            || length < 0
            || src_pos as usize + length as usize > src_len
            || dst_pos as usize + length as usize > dst_len;
        if out_of_bounds {
            return Err(context.throw(Fault::ArrayIndexOutOfBounds, None));
        }
        Ok(Self {
            src,
            src_pos: src_pos as usize,
            dst,
            dst_pos: dst_pos as usize,
            length: length as usize,
        })
    }

    /// Copy within one array. Returns `false` if source and destination
    /// differ.
    fn copy_overlapping(&self) -> bool {
        if !Arc::ptr_eq(self.src, self.dst) {
            return false;
        }
        if let ObjectData::Array(array) = &mut *self.src.data() {
            array.copy_within(self.src_pos, self.dst_pos, self.length);
        }
        true
    }

    fn values(&self) -> Vec<Value> {
        match &*self.src.data() {
            ObjectData::Array(array) => (self.src_pos..self.src_pos + self.length)
                .map(|i| array.load(i))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// `JVM.unchecked_*_arraycopy`: callers guarantee matching element types.
fn unchecked_array_copy(thread: &mut Thread, args: &[Value]) -> VmResult<Option<Value>> {
    let context = thread.context().clone();
    let range = CopyRange::new(&context, args)?;
    if range.copy_overlapping() {
        return Ok(None);
    }
    let values = range.values();
    if let ObjectData::Array(array) = &mut *range.dst.data() {
        for (i, value) in values.into_iter().enumerate() {
            array.store(range.dst_pos + i, value)?;
        }
    }
    Ok(None)
}

fn array_copy(thread: &mut Thread, args: &[Value]) -> VmResult<Option<Value>> {
    let context = thread.context().clone();
    let range = CopyRange::new(&context, args)?;
    if range.copy_overlapping() {
        return Ok(None);
    }
    let (src, dst, dst_pos) = (range.src, range.dst, range.dst_pos);

    let primitive_mismatch = match (&src.class.element, &dst.class.element) {
        (Some(a), Some(b)) => a.kind() != b.kind(),
        _ => true,
    };
    if primitive_mismatch {
        return Err(context.throw(Fault::ArrayStore, None));
    }

    let values = range.values();
    let element_class = match &dst.class.element {
        Some(crate::ElementType::Reference(class)) => Some(class.clone()),
        _ => None,
    };
    for (i, value) in values.into_iter().enumerate() {
        if let (Some(target), Value::Reference(Some(obj))) = (&element_class, &value) {
            if !obj.class.is_assignable_to(target) {
                return Err(context.throw(Fault::ArrayStore, Some(obj.class.name.clone())));
            }
        }
        if let ObjectData::Array(array) = &mut *dst.data() {
            array.store(dst_pos + i, value)?;
        }
    }
    Ok(None)
}
