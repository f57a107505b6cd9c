//! The object heap.
//!
//! Every Quill object lives in one arena owned by [`Heap`], addressed by
//! copyable [`ObjRef`] handles. The object graph is cyclic (closures end up
//! in fields of instances whose methods are those closures), so liveness is
//! decided by tracing from roots: the VM hands the collector its root set
//! and everything unreached is swept. Strings are interned, which makes
//! handle identity the same as string equality.

use std::collections::HashMap;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::value::Value;
use crate::vm::Vm;

/// Handle to an object in the [`Heap`].
///
/// Compares by identity. A handle is valid as long as the object is
/// reachable from the VM's roots at every collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

/// A string-keyed table: keys are handles of interned strings.
pub type Table = HashMap<ObjRef, Value>;

/// A host function callable from scripts.
///
/// Returns its result, or [`Value::None`] to signal failure after reporting
/// a diagnostic through [`Vm::raise`]. For method-table natives the receiver
/// is `args[0]`.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// A compiled function: its bytecode plus call metadata.
#[derive(Debug)]
pub struct Function {
    /// Number of declared parameters.
    pub arity: usize,
    /// Number of upvalues a closure over this function captures.
    pub upvalue_count: usize,
    /// The compiled body. Shared with call frames.
    pub chunk: Rc<Chunk>,
    /// Interned name; `None` for a module's top-level script.
    pub name: Option<ObjRef>,
    /// The library this function was compiled into.
    pub library: ObjRef,
}

/// A function plus its captured upvalue cells.
#[derive(Debug)]
pub struct Closure {
    /// The wrapped [`Function`].
    pub function: ObjRef,
    /// Captured cells, one per upvalue of the function.
    pub upvalues: Vec<ObjRef>,
}

/// A reference cell giving closures access to an enclosing scope's variable.
#[derive(Debug)]
pub enum Upvalue {
    /// The variable still lives on the value stack, at this slot.
    Open(usize),
    /// The scope has exited; the cell owns the last value.
    Closed(Value),
}

/// A class: a name and its method tables.
#[derive(Debug, Default)]
pub struct Class {
    /// Interned class name.
    pub name: Option<ObjRef>,
    /// Public methods, name to closure.
    pub methods: Table,
    /// Private methods, reachable only through `this`.
    pub private_methods: Table,
}

/// An instance of a class with its own field tables.
#[derive(Debug)]
pub struct Instance {
    /// The instantiated class.
    pub class: ObjRef,
    /// Public fields.
    pub fields: Table,
    /// Private fields, reachable only through `this`.
    pub private_fields: Table,
}

/// A method closure bound to the receiver it was accessed through.
#[derive(Debug)]
pub struct BoundMethod {
    /// The receiver `this` will resolve to.
    pub receiver: Value,
    /// The closure to run.
    pub method: ObjRef,
}

/// A named namespace of top-level bindings: a compiled module or a native
/// library.
#[derive(Debug)]
pub struct Library {
    /// Interned library name.
    pub name: ObjRef,
    /// Public bindings, visible to importers.
    pub values: Table,
    /// Private bindings, visible only inside the library.
    pub private_values: Table,
}

/// Any heap-allocated runtime object.
#[derive(Debug)]
pub enum Object {
    /// An interned immutable string.
    String(Rc<str>),
    /// A compiled function body.
    Function(Function),
    /// A host function.
    Native(NativeFn),
    /// A function with captured upvalues.
    Closure(Closure),
    /// A closure's captured variable cell.
    Upvalue(Upvalue),
    /// A class.
    Class(Class),
    /// A class instance.
    Instance(Instance),
    /// A method bound to a receiver.
    BoundMethod(BoundMethod),
    /// A mutable list of values.
    List(Vec<Value>),
    /// A module or native library namespace.
    Library(Library),
}

#[derive(Debug)]
struct Slot {
    obj: Object,
    mark: bool,
}

/// The object arena and its mark-and-sweep collector.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    interned: HashMap<Rc<str>, ObjRef>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    // the bit value meaning "marked" this cycle; flipped after each sweep
    // instead of clearing every survivor's bit
    mark_val: bool,
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    const FIRST_COLLECTION: usize = 1024 * 1024;

    /// An empty heap.
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            interned: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: Heap::FIRST_COLLECTION,
            mark_val: true,
        }
    }

    /// Moves an object into the arena and returns its handle.
    /// Never collects; collection is the VM's decision.
    pub fn alloc(&mut self, obj: Object) -> ObjRef {
        self.bytes_allocated += size_of_object(&obj);
        let slot = Slot {
            obj,
            mark: !self.mark_val,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Returns the handle of the interned string with this content,
    /// allocating it on first sight.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(&existing) = self.interned.get(text) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(text);
        let handle = self.alloc(Object::String(Rc::clone(&rc)));
        self.interned.insert(rc, handle);
        handle
    }

    /// Shared access to the object behind a handle.
    pub fn get(&self, r: ObjRef) -> &Object {
        match &self.slots[r.0 as usize] {
            Some(slot) => &slot.obj,
            None => unreachable!("dangling object handle"),
        }
    }

    /// Exclusive access to the object behind a handle.
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match &mut self.slots[r.0 as usize] {
            Some(slot) => &mut slot.obj,
            None => unreachable!("dangling object handle"),
        }
    }

    /// The string behind a handle, if it is one.
    pub fn as_string(&self, r: ObjRef) -> Option<&Rc<str>> {
        match self.get(r) {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    /// Number of live objects in the arena.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether enough has been allocated since the last collection that the
    /// VM should hand over its roots.
    pub fn wants_collection(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Collects every object not reachable from `roots`: mark, trace through
    /// the gray worklist, drop dead entries from the intern table, sweep.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) {
        self.gray.clear();
        for root in roots {
            self.mark_object(root);
        }
        while let Some(r) = self.gray.pop() {
            for child in self.children_of(r) {
                self.mark_object(child);
            }
        }

        // The intern table holds its strings weakly: unmarked entries go
        // before the sweep frees them.
        let slots = &self.slots;
        let mark_val = self.mark_val;
        self.interned
            .retain(|_, r| matches!(&slots[r.0 as usize], Some(slot) if slot.mark == mark_val));

        let mut live_bytes = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.mark != self.mark_val => {
                    *entry = None;
                    self.free.push(index as u32);
                }
                Some(slot) => live_bytes += size_of_object(&slot.obj),
                None => {}
            }
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = (self.bytes_allocated * 2).max(Heap::FIRST_COLLECTION);
        self.mark_val = !self.mark_val;
    }

    fn mark_object(&mut self, r: ObjRef) {
        if let Some(Some(slot)) = self.slots.get_mut(r.0 as usize) {
            if slot.mark == self.mark_val {
                return;
            }
            slot.mark = self.mark_val;
            self.gray.push(r);
        }
    }

    fn children_of(&self, r: ObjRef) -> Vec<ObjRef> {
        let mut refs = Vec::new();
        match self.get(r) {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(function) => {
                refs.extend(function.name);
                refs.push(function.library);
                push_values(&mut refs, function.chunk.constants.iter().copied());
            }
            Object::Closure(closure) => {
                refs.push(closure.function);
                refs.extend(closure.upvalues.iter().copied());
            }
            Object::Upvalue(Upvalue::Open(_)) => {}
            Object::Upvalue(Upvalue::Closed(value)) => push_values(&mut refs, [*value]),
            Object::Class(class) => {
                refs.extend(class.name);
                push_table(&mut refs, &class.methods);
                push_table(&mut refs, &class.private_methods);
            }
            Object::Instance(instance) => {
                refs.push(instance.class);
                push_table(&mut refs, &instance.fields);
                push_table(&mut refs, &instance.private_fields);
            }
            Object::BoundMethod(bound) => {
                push_values(&mut refs, [bound.receiver]);
                refs.push(bound.method);
            }
            Object::List(items) => push_values(&mut refs, items.iter().copied()),
            Object::Library(library) => {
                refs.push(library.name);
                push_table(&mut refs, &library.values);
                push_table(&mut refs, &library.private_values);
            }
        }
        refs
    }

    /// The runtime type name of a value, as `type()` reports it.
    pub fn type_of(&self, value: Value) -> &'static str {
        match value {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(r) => match self.get(r) {
                Object::String(_) => "string",
                Object::Function(_) | Object::Closure(_) | Object::BoundMethod(_) => "function",
                Object::Native(_) => "native",
                Object::Upvalue(_) => "upvalue",
                Object::Class(_) => "class",
                Object::Instance(_) => "instance",
                Object::List(_) => "list",
                Object::Library(_) => "library",
            },
        }
    }

    /// Structural equality: numbers by value, lists element-wise, every
    /// other object by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        self.values_equal_seen(a, b, &mut Vec::new())
    }

    fn values_equal_seen(&self, a: Value, b: Value, seen: &mut Vec<(ObjRef, ObjRef)>) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (Object::List(xs), Object::List(ys)) => {
                        // a pair already on the comparison path can only
                        // differ through some other pair, so treat it as equal
                        if seen.contains(&(x, y)) {
                            return true;
                        }
                        seen.push((x, y));
                        let equal = xs.len() == ys.len()
                            && xs
                                .iter()
                                .zip(ys)
                                .all(|(p, q)| self.values_equal_seen(*p, *q, seen));
                        seen.pop();
                        equal
                    }
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    /// Renders a value the way `print` shows it.
    pub fn show_value(&self, value: Value) -> String {
        match value {
            Value::None => "none".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.show_object(r),
        }
    }

    fn show_object(&self, r: ObjRef) -> String {
        match self.get(r) {
            Object::String(s) => s.to_string(),
            Object::Function(function) => self.show_function(function),
            Object::Native(_) => "<native fn>".to_string(),
            Object::Closure(closure) => match self.get(closure.function) {
                Object::Function(function) => self.show_function(function),
                _ => "<fn>".to_string(),
            },
            Object::BoundMethod(bound) => match self.get(bound.method) {
                Object::Closure(closure) => self.show_object(closure.function),
                _ => "<fn>".to_string(),
            },
            Object::Upvalue(_) => "upvalue".to_string(),
            Object::Class(class) => self.show_name(class.name, "class"),
            Object::Instance(instance) => match self.get(instance.class) {
                Object::Class(class) => {
                    format!("{} instance", self.show_name(class.name, "class"))
                }
                _ => "instance".to_string(),
            },
            Object::List(items) => {
                let shown: Vec<String> = items.iter().map(|v| self.show_value(*v)).collect();
                format!("[{}]", shown.join(", "))
            }
            Object::Library(library) => {
                format!("<library {}>", self.show_name(Some(library.name), "?"))
            }
        }
    }

    fn show_function(&self, function: &Function) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.show_name(Some(name), "?")),
            None => "<script>".to_string(),
        }
    }

    fn show_name(&self, name: Option<ObjRef>, fallback: &str) -> String {
        name.and_then(|r| self.as_string(r))
            .map(|s| s.to_string())
            .unwrap_or_else(|| fallback.to_string())
    }
}

fn push_values(refs: &mut Vec<ObjRef>, values: impl IntoIterator<Item = Value>) {
    for value in values {
        if let Value::Obj(r) = value {
            refs.push(r);
        }
    }
}

fn push_table(refs: &mut Vec<ObjRef>, table: &Table) {
    for (&key, &value) in table {
        refs.push(key);
        if let Value::Obj(r) = value {
            refs.push(r);
        }
    }
}

fn format_number(n: f64) -> String {
    if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// Rough per-object cost, used only to decide when to collect. Interior
// growth of lists and tables between allocations goes unobserved until the
// next sweep recomputes the total.
fn size_of_object(obj: &Object) -> usize {
    use std::mem::size_of;
    let payload = match obj {
        Object::String(s) => s.len(),
        Object::Function(f) => {
            f.chunk.code.len()
                + f.chunk.lines.len() * size_of::<usize>()
                + f.chunk.constants.len() * size_of::<Value>()
        }
        Object::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
        Object::List(items) => items.len() * size_of::<Value>(),
        Object::Class(c) => table_bytes(&c.methods) + table_bytes(&c.private_methods),
        Object::Instance(i) => table_bytes(&i.fields) + table_bytes(&i.private_fields),
        Object::Library(l) => table_bytes(&l.values) + table_bytes(&l.private_values),
        Object::Native(_) | Object::Upvalue(_) | Object::BoundMethod(_) => 0,
    };
    std::mem::size_of::<Object>() + payload
}

fn table_bytes(table: &Table) -> usize {
    table.len() * (std::mem::size_of::<ObjRef>() + std::mem::size_of::<Value>())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_gives_identical_handles() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_frees_unreachable_cycles() {
        let mut heap = Heap::new();
        let a = heap.alloc(Object::List(Vec::new()));
        let b = heap.alloc(Object::List(vec![Value::Obj(a)]));
        if let Object::List(items) = heap.get_mut(a) {
            items.push(Value::Obj(b));
        }
        let keep = heap.intern("keep");
        assert_eq!(heap.live_objects(), 3);

        heap.collect([keep]);
        assert_eq!(heap.live_objects(), 1);
        assert!(heap.as_string(keep).is_some());
    }

    #[test]
    fn rooted_objects_survive_repeated_collections() {
        let mut heap = Heap::new();
        let s = heap.intern("still here");
        let list = heap.alloc(Object::List(vec![Value::Obj(s)]));
        for _ in 0..3 {
            heap.collect([list]);
            assert_eq!(heap.live_objects(), 2);
        }
        heap.collect([]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn dead_strings_leave_the_intern_table() {
        let mut heap = Heap::new();
        heap.intern("transient");
        heap.collect([]);
        assert_eq!(heap.live_objects(), 0);
        // re-interning after collection allocates a fresh object
        let again = heap.intern("transient");
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(&**heap.as_string(again).unwrap(), "transient");
    }

    #[test]
    fn list_equality_is_deep() {
        let mut heap = Heap::new();
        let hello = heap.intern("hello");
        let a = heap.alloc(Object::List(vec![Value::Number(1.0), Value::Obj(hello)]));
        let b = heap.alloc(Object::List(vec![Value::Number(1.0), Value::Obj(hello)]));
        let c = heap.alloc(Object::List(vec![Value::Number(2.0)]));
        assert!(heap.values_equal(Value::Obj(a), Value::Obj(b)));
        assert!(!heap.values_equal(Value::Obj(a), Value::Obj(c)));
    }

    #[test]
    fn cyclic_lists_compare_without_diverging() {
        let mut heap = Heap::new();
        let a = heap.alloc(Object::List(vec![Value::Number(1.0)]));
        let b = heap.alloc(Object::List(vec![Value::Obj(a)]));
        if let Object::List(items) = heap.get_mut(a) {
            items[0] = Value::Obj(b);
        }
        // a and b are the same unfolding, so they compare equal
        assert!(heap.values_equal(Value::Obj(a), Value::Obj(b)));
        let c = heap.alloc(Object::List(vec![Value::Number(2.0)]));
        assert!(!heap.values_equal(Value::Obj(a), Value::Obj(c)));
    }

    #[test]
    fn numbers_print_without_trailing_zeroes() {
        let heap = Heap::new();
        assert_eq!(heap.show_value(Value::Number(3.0)), "3");
        assert_eq!(heap.show_value(Value::Number(3.5)), "3.5");
        assert_eq!(heap.show_value(Value::None), "none");
    }
}
