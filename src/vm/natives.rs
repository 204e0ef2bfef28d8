// Veld Native Functions
// Host functions installed into the global table and the per-type method
// tables. Convention: `args[0]` is the callee (or the receiver for
// method-style natives); errors are raised with `Vm::native_error` and
// signalled by returning `Value::Empty`.

use crate::vm::heap::Handle;
use crate::vm::table::ValueMap;
use crate::vm::value::{NativeFn, Obj, ObjResult, Value};
use crate::vm::vm::Vm;

pub fn install(vm: &mut Vm) {
    vm.define_native_global("print", native_print);
    vm.define_native_global("type", native_type);
    vm.define_native_global("assert", native_assert);
    vm.define_native_global("str", native_str);
    vm.define_native_global("set", native_set);

    install_methods(
        vm,
        Kind::String,
        &[
            ("len", string_len as NativeFn),
            ("upper", string_upper),
            ("lower", string_lower),
            ("contains", string_contains),
            ("split", string_split),
            ("trim", string_trim),
            ("replace", string_replace),
            ("toString", identity),
        ],
    );
    install_methods(
        vm,
        Kind::List,
        &[
            ("push", list_push as NativeFn),
            ("pop", list_pop),
            ("len", list_len),
            ("insert", list_insert),
            ("remove", list_remove),
            ("contains", list_contains),
            ("join", list_join),
            ("toSet", list_to_set),
        ],
    );
    install_methods(
        vm,
        Kind::Dict,
        &[
            ("get", dict_get as NativeFn),
            ("keys", dict_keys),
            ("values", dict_values),
            ("remove", dict_remove),
            ("exists", dict_exists),
            ("len", dict_len),
        ],
    );
    install_methods(
        vm,
        Kind::Set,
        &[
            ("add", set_add as NativeFn),
            ("contains", set_contains),
            ("remove", set_remove),
            ("len", set_len),
        ],
    );
    install_methods(vm, Kind::Number, &[("toString", to_string as NativeFn)]);
    install_methods(vm, Kind::Bool, &[("toString", to_string as NativeFn)]);
    install_methods(vm, Kind::Nil, &[("toString", to_string as NativeFn)]);
    install_methods(
        vm,
        Kind::Result,
        &[
            ("success", result_success as NativeFn),
            ("unwrap", result_unwrap),
            ("unwrapError", result_unwrap_error),
        ],
    );
    install_methods(
        vm,
        Kind::File,
        &[
            ("read", file_read as NativeFn),
            ("write", file_write),
            ("close", file_close),
        ],
    );
}

enum Kind {
    String,
    List,
    Dict,
    Set,
    Number,
    Bool,
    Nil,
    Result,
    File,
}

fn install_methods(vm: &mut Vm, kind: Kind, methods: &[(&str, NativeFn)]) {
    for &(name, function) in methods {
        let (name, native) = vm.make_native(name, function);
        let table = match kind {
            Kind::String => &mut vm.string_methods,
            Kind::List => &mut vm.list_methods,
            Kind::Dict => &mut vm.dict_methods,
            Kind::Set => &mut vm.set_methods,
            Kind::Number => &mut vm.number_methods,
            Kind::Bool => &mut vm.bool_methods,
            Kind::Nil => &mut vm.nil_methods,
            Kind::Result => &mut vm.result_methods,
            Kind::File => &mut vm.file_methods,
        };
        table.insert(name, native);
    }
}

/// Build a success Result.
pub fn ok_result(vm: &mut Vm, value: Value) -> Value {
    Value::Obj(vm.heap.allocate(Obj::Result(ObjResult {
        success: true,
        value,
    })))
}

/// Build an error Result carrying a message string.
pub fn err_result(vm: &mut Vm, message: &str) -> Value {
    let value = Value::Obj(vm.heap.copy_string(message));
    Value::Obj(vm.heap.allocate(Obj::Result(ObjResult {
        success: false,
        value,
    })))
}

// ---- shared helpers ---------------------------------------------------

fn arity_error(vm: &mut Vm, name: &str, expected: &str, got: usize) -> Value {
    vm.native_error(format!(
        "{}() expected {} arguments but got {}.",
        name, expected, got
    ));
    Value::Empty
}

fn receiver(args: &[Value]) -> Handle {
    args[0].as_handle().expect("native method without receiver")
}

fn string_arg(vm: &Vm, value: Value) -> Option<String> {
    match value {
        Value::Obj(handle) => match vm.heap.get(handle) {
            Obj::String(s) => Some(s.chars.to_string()),
            _ => None,
        },
        _ => None,
    }
}

fn number_arg(vm: &mut Vm, value: Value, name: &str) -> Option<f64> {
    match value.as_number() {
        Some(n) => Some(n),
        None => {
            let found = vm.heap.type_name(value);
            vm.native_error(format!("{}() expected a number, got '{}'.", name, found));
            None
        }
    }
}

// ---- globals ----------------------------------------------------------

fn native_print(vm: &mut Vm, args: &[Value]) -> Value {
    let rendered: Vec<String> = args[1..]
        .iter()
        .map(|value| vm.heap.value_display(*value))
        .collect();
    println!("{}", rendered.join(" "));
    Value::Nil
}

fn native_type(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "type", "1", args.len() - 1);
    }
    let name = vm.heap.type_name(args[1]);
    Value::Obj(vm.heap.copy_string(name))
}

fn native_assert(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 && args.len() != 3 {
        return arity_error(vm, "assert", "1 or 2", args.len() - 1);
    }
    if args[1].is_truthy() {
        return Value::Nil;
    }
    let message = if args.len() == 3 {
        vm.heap.value_display(args[2])
    } else {
        "Assertion failed.".to_owned()
    };
    vm.native_error(message);
    Value::Empty
}

fn native_str(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "str", "1", args.len() - 1);
    }
    let rendered = vm.heap.value_display(args[1]);
    Value::Obj(vm.heap.take_string(rendered))
}

/// `set(a, b, ...)` builds a set from its arguments.
fn native_set(vm: &mut Vm, args: &[Value]) -> Value {
    let mut map = ValueMap::new();
    for &item in &args[1..] {
        let hash = match vm.heap.hash_value(item) {
            Some(hash) => hash,
            None => {
                let found = vm.heap.type_name(item);
                vm.native_error(format!("Cannot add unhashable type '{}' to a set.", found));
                return Value::Empty;
            }
        };
        map.insert(item, hash, Value::Bool(true));
    }
    Value::Obj(vm.heap.allocate(Obj::Set(map)))
}

fn identity(_vm: &mut Vm, args: &[Value]) -> Value {
    args[0]
}

fn to_string(vm: &mut Vm, args: &[Value]) -> Value {
    let rendered = vm.heap.value_display(args[0]);
    Value::Obj(vm.heap.take_string(rendered))
}

// ---- strings ----------------------------------------------------------

fn string_len(vm: &mut Vm, args: &[Value]) -> Value {
    let count = vm.heap.string(receiver(args)).chars().count();
    Value::Number(count as f64)
}

fn string_upper(vm: &mut Vm, args: &[Value]) -> Value {
    let upper = vm.heap.string(receiver(args)).to_uppercase();
    Value::Obj(vm.heap.take_string(upper))
}

fn string_lower(vm: &mut Vm, args: &[Value]) -> Value {
    let lower = vm.heap.string(receiver(args)).to_lowercase();
    Value::Obj(vm.heap.take_string(lower))
}

fn string_contains(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "contains", "1", args.len() - 1);
    }
    let needle = match string_arg(vm, args[1]) {
        Some(needle) => needle,
        None => {
            vm.native_error("contains() expected a string argument.");
            return Value::Empty;
        }
    };
    Value::Bool(vm.heap.string(receiver(args)).contains(&needle))
}

fn string_split(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "split", "1", args.len() - 1);
    }
    let separator = match string_arg(vm, args[1]) {
        Some(separator) if !separator.is_empty() => separator,
        Some(_) => {
            vm.native_error("split() separator cannot be empty.");
            return Value::Empty;
        }
        None => {
            vm.native_error("split() expected a string argument.");
            return Value::Empty;
        }
    };
    let pieces: Vec<String> = vm
        .heap
        .string(receiver(args))
        .split(&separator)
        .map(str::to_owned)
        .collect();
    let mut items = Vec::with_capacity(pieces.len());
    for piece in pieces {
        items.push(Value::Obj(vm.heap.take_string(piece)));
    }
    Value::Obj(vm.heap.allocate(Obj::List(items)))
}

fn string_trim(vm: &mut Vm, args: &[Value]) -> Value {
    let trimmed = vm.heap.string(receiver(args)).trim().to_owned();
    Value::Obj(vm.heap.take_string(trimmed))
}

fn string_replace(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 3 {
        return arity_error(vm, "replace", "2", args.len() - 1);
    }
    let (from, to) = match (string_arg(vm, args[1]), string_arg(vm, args[2])) {
        (Some(from), Some(to)) if !from.is_empty() => (from, to),
        (Some(_), Some(_)) => {
            vm.native_error("replace() pattern cannot be empty.");
            return Value::Empty;
        }
        _ => {
            vm.native_error("replace() expected two string arguments.");
            return Value::Empty;
        }
    };
    let replaced = vm.heap.string(receiver(args)).replace(&from, &to);
    Value::Obj(vm.heap.take_string(replaced))
}

// ---- lists ------------------------------------------------------------

fn list_push(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "push", "1", args.len() - 1);
    }
    vm.heap.list_mut(receiver(args)).push(args[1]);
    Value::Nil
}

fn list_pop(vm: &mut Vm, args: &[Value]) -> Value {
    match vm.heap.list_mut(receiver(args)).pop() {
        Some(value) => value,
        None => {
            vm.native_error("Cannot pop from an empty list.");
            Value::Empty
        }
    }
}

fn list_len(vm: &mut Vm, args: &[Value]) -> Value {
    Value::Number(vm.heap.list(receiver(args)).len() as f64)
}

fn list_insert(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 3 {
        return arity_error(vm, "insert", "2", args.len() - 1);
    }
    let index = match number_arg(vm, args[1], "insert") {
        Some(index) => index as usize,
        None => return Value::Empty,
    };
    let list = receiver(args);
    if index > vm.heap.list(list).len() {
        vm.native_error(format!(
            "insert() index {} out of range (length {}).",
            index,
            vm.heap.list(list).len()
        ));
        return Value::Empty;
    }
    vm.heap.list_mut(list).insert(index, args[2]);
    Value::Nil
}

fn list_remove(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "remove", "1", args.len() - 1);
    }
    let index = match number_arg(vm, args[1], "remove") {
        Some(index) => index as usize,
        None => return Value::Empty,
    };
    let list = receiver(args);
    if index >= vm.heap.list(list).len() {
        vm.native_error(format!(
            "remove() index {} out of range (length {}).",
            index,
            vm.heap.list(list).len()
        ));
        return Value::Empty;
    }
    vm.heap.list_mut(list).remove(index)
}

fn list_contains(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "contains", "1", args.len() - 1);
    }
    let found = vm.heap.list(receiver(args)).iter().any(|item| *item == args[1]);
    Value::Bool(found)
}

fn list_join(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "join", "1", args.len() - 1);
    }
    let separator = match string_arg(vm, args[1]) {
        Some(separator) => separator,
        None => {
            vm.native_error("join() expected a string argument.");
            return Value::Empty;
        }
    };
    let items = vm.heap.list(receiver(args)).clone();
    let rendered: Vec<String> = items
        .iter()
        .map(|item| vm.heap.value_display(*item))
        .collect();
    Value::Obj(vm.heap.take_string(rendered.join(&separator)))
}

fn list_to_set(vm: &mut Vm, args: &[Value]) -> Value {
    let items = vm.heap.list(receiver(args)).clone();
    let mut map = ValueMap::new();
    for item in items {
        let hash = match vm.heap.hash_value(item) {
            Some(hash) => hash,
            None => {
                let found = vm.heap.type_name(item);
                vm.native_error(format!("Cannot add unhashable type '{}' to a set.", found));
                return Value::Empty;
            }
        };
        map.insert(item, hash, Value::Bool(true));
    }
    Value::Obj(vm.heap.allocate(Obj::Set(map)))
}

// ---- dicts ------------------------------------------------------------

fn dict_hash(vm: &mut Vm, key: Value) -> Option<u32> {
    match vm.heap.hash_value(key) {
        Some(hash) => Some(hash),
        None => {
            let found = vm.heap.type_name(key);
            vm.native_error(format!("Unhashable dict key type '{}'.", found));
            None
        }
    }
}

fn dict_map(vm: &Vm, handle: Handle) -> &ValueMap {
    match vm.heap.get(handle) {
        Obj::Dict(map) | Obj::Set(map) => map,
        other => panic!("expected dict or set, found {:?}", other),
    }
}

/// `dict.get(key)` or `dict.get(key, default)`; never raises on a missing
/// key, unlike subscripting.
fn dict_get(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 && args.len() != 3 {
        return arity_error(vm, "get", "1 or 2", args.len() - 1);
    }
    let hash = match dict_hash(vm, args[1]) {
        Some(hash) => hash,
        None => return Value::Empty,
    };
    let fallback = if args.len() == 3 { args[2] } else { Value::Nil };
    dict_map(vm, receiver(args)).get(args[1], hash).unwrap_or(fallback)
}

fn dict_keys(vm: &mut Vm, args: &[Value]) -> Value {
    let keys: Vec<Value> = dict_map(vm, receiver(args))
        .iter()
        .map(|(key, _)| key)
        .collect();
    Value::Obj(vm.heap.allocate(Obj::List(keys)))
}

fn dict_values(vm: &mut Vm, args: &[Value]) -> Value {
    let values: Vec<Value> = dict_map(vm, receiver(args))
        .iter()
        .map(|(_, value)| value)
        .collect();
    Value::Obj(vm.heap.allocate(Obj::List(values)))
}

fn dict_remove(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "remove", "1", args.len() - 1);
    }
    let hash = match dict_hash(vm, args[1]) {
        Some(hash) => hash,
        None => return Value::Empty,
    };
    let handle = receiver(args);
    match vm.heap.get_mut(handle) {
        Obj::Dict(map) | Obj::Set(map) => Value::Bool(map.remove(args[1], hash)),
        other => panic!("expected dict or set, found {:?}", other),
    }
}

fn dict_exists(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "exists", "1", args.len() - 1);
    }
    let hash = match dict_hash(vm, args[1]) {
        Some(hash) => hash,
        None => return Value::Empty,
    };
    Value::Bool(dict_map(vm, receiver(args)).contains(args[1], hash))
}

fn dict_len(vm: &mut Vm, args: &[Value]) -> Value {
    Value::Number(dict_map(vm, receiver(args)).len() as f64)
}

// ---- sets -------------------------------------------------------------

fn set_add(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(vm, "add", "1", args.len() - 1);
    }
    let hash = match dict_hash(vm, args[1]) {
        Some(hash) => hash,
        None => return Value::Empty,
    };
    let handle = receiver(args);
    if let Obj::Set(map) = vm.heap.get_mut(handle) {
        map.insert(args[1], hash, Value::Bool(true));
    }
    Value::Nil
}

fn set_contains(vm: &mut Vm, args: &[Value]) -> Value {
    dict_exists(vm, args)
}

fn set_remove(vm: &mut Vm, args: &[Value]) -> Value {
    dict_remove(vm, args)
}

fn set_len(vm: &mut Vm, args: &[Value]) -> Value {
    dict_len(vm, args)
}

// ---- results ----------------------------------------------------------

fn result_of(vm: &Vm, args: &[Value]) -> (bool, Value) {
    match vm.heap.get(receiver(args)) {
        Obj::Result(result) => (result.success, result.value),
        other => panic!("expected result, found {:?}", other),
    }
}

fn result_success(vm: &mut Vm, args: &[Value]) -> Value {
    let (success, _) = result_of(vm, args);
    Value::Bool(success)
}

fn result_unwrap(vm: &mut Vm, args: &[Value]) -> Value {
    let (success, value) = result_of(vm, args);
    if success {
        return value;
    }
    let message = vm.heap.value_display(value);
    vm.native_error(format!("Unwrapped an error Result: {}.", message));
    Value::Empty
}

fn result_unwrap_error(vm: &mut Vm, args: &[Value]) -> Value {
    let (success, value) = result_of(vm, args);
    if !success {
        return value;
    }
    vm.native_error("Unwrapped the error of a success Result.");
    Value::Empty
}

// ---- files ------------------------------------------------------------

fn file_read(vm: &mut Vm, args: &[Value]) -> Value {
    use std::io::Read;
    let handle = receiver(args);
    let contents = match vm.heap.get_mut(handle) {
        Obj::File(file) => match file.file.as_mut() {
            Some(inner) => {
                let mut contents = String::new();
                match inner.read_to_string(&mut contents) {
                    Ok(_) => Ok(contents),
                    Err(err) => Err(format!("Could not read file: {}.", err)),
                }
            }
            None => Err("File is closed.".to_owned()),
        },
        other => panic!("expected file, found {:?}", other),
    };
    match contents {
        Ok(contents) => Value::Obj(vm.heap.take_string(contents)),
        Err(message) => {
            vm.native_error(message);
            Value::Empty
        }
    }
}

fn file_write(vm: &mut Vm, args: &[Value]) -> Value {
    use std::io::Write;
    if args.len() != 2 {
        return arity_error(vm, "write", "1", args.len() - 1);
    }
    let text = match string_arg(vm, args[1]) {
        Some(text) => text,
        None => {
            vm.native_error("write() expected a string argument.");
            return Value::Empty;
        }
    };
    let handle = receiver(args);
    let outcome = match vm.heap.get_mut(handle) {
        Obj::File(file) => match file.file.as_mut() {
            Some(inner) => inner
                .write_all(text.as_bytes())
                .map_err(|err| format!("Could not write file: {}.", err)),
            None => Err("File is closed.".to_owned()),
        },
        other => panic!("expected file, found {:?}", other),
    };
    match outcome {
        Ok(()) => Value::Number(text.len() as f64),
        Err(message) => {
            vm.native_error(message);
            Value::Empty
        }
    }
}

fn file_close(vm: &mut Vm, args: &[Value]) -> Value {
    let handle = receiver(args);
    if let Obj::File(file) = vm.heap.get_mut(handle) {
        file.file.take();
    }
    Value::Nil
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(vm: &mut Vm, source: &str) -> Value {
        vm.interpret(source, "test", false).expect("script failed");
        let key = vm.heap.copy_string("out");
        let module = vm.heap.copy_string("test");
        match vm.modules_table().get(module) {
            Some(Value::Obj(module)) => {
                vm.heap.module(module).table.get(key).unwrap_or(Value::Nil)
            }
            _ => Value::Nil,
        }
    }

    #[test]
    fn string_methods_round_trip() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(&mut vm, "var out = \" Hi \".trim().lower();"),
            Value::Obj(vm.heap.copy_string("hi"))
        );
        assert_eq!(
            eval(&mut vm, "var out = \"a,b,c\".split(\",\").len();"),
            Value::Number(3.0)
        );
        assert_eq!(
            eval(&mut vm, "var out = \"banana\".replace(\"na\", \"no\");"),
            Value::Obj(vm.heap.copy_string("banono"))
        );
        assert_eq!(
            eval(&mut vm, "var out = \"hello\".contains(\"ell\");"),
            Value::Bool(true)
        );
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(
                &mut vm,
                "var l = [1, 2]; l.push(3); l.insert(0, 0); l.remove(2); \
                 var out = l.join(\"-\");"
            ),
            Value::Obj(vm.heap.copy_string("0-1-3"))
        );
        let mut vm = Vm::new();
        vm.interpret("[].pop();", "test", false)
            .expect_err("pop on empty list should raise");
    }

    #[test]
    fn dict_get_prefers_default_over_error() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(
                &mut vm,
                "var d = {\"a\": 1}; var out = d.get(\"missing\", 9) + d.get(\"a\");"
            ),
            Value::Number(10.0)
        );
        assert_eq!(
            eval(&mut vm, "var d = {\"a\": 1, \"b\": 2}; var out = d.keys().len();"),
            Value::Number(2.0)
        );
    }

    #[test]
    fn sets_deduplicate() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(
                &mut vm,
                "var s = set(1, 2, 2, 3); s.add(3); var out = s.len();"
            ),
            Value::Number(3.0)
        );
        assert_eq!(
            eval(&mut vm, "var s = [1, 1, 2].toSet(); var out = s.contains(2);"),
            Value::Bool(true)
        );
    }

    #[test]
    fn assert_raises_on_falsey() {
        let mut vm = Vm::new();
        assert!(vm.interpret("assert(1 == 1);", "test", false).is_ok());
        assert!(vm.interpret("assert(1 == 2);", "test", false).is_err());
    }

    #[test]
    fn result_unwrap_behaviour() {
        let mut vm = Vm::new();
        let ok = ok_result(&mut vm, Value::Number(5.0));
        vm.push(ok);
        assert_eq!(result_success(&mut vm, &[ok]), Value::Bool(true));
        assert_eq!(result_unwrap(&mut vm, &[ok]), Value::Number(5.0));
        let err = err_result(&mut vm, "boom");
        vm.push(err);
        assert_eq!(result_success(&mut vm, &[err]), Value::Bool(false));
        assert_eq!(result_unwrap(&mut vm, &[err]), Value::Empty);
    }
}
