// Veld Builtin Modules
// Host-provided modules resolved by `import Name;` before any file lookup.

use rustc_hash::FxHashMap;

use crate::vm::heap::Handle;
use crate::vm::natives::{err_result, ok_result};
use crate::vm::table::Table;
use crate::vm::value::{NativeFn, Obj, ObjModule, Value};
use crate::vm::vm::Vm;

type ModuleBuilder = fn(&mut Vm) -> Handle;

fn registry() -> FxHashMap<&'static str, ModuleBuilder> {
    let mut builders: FxHashMap<&'static str, ModuleBuilder> = FxHashMap::default();
    builders.insert("Math", build_math);
    builders.insert("System", build_system);
    builders
}

/// Build the builtin module `name`, or None if there is no such builtin
/// (and the import should fall through to the filesystem).
pub fn build_builtin(vm: &mut Vm, name: &str) -> Option<Handle> {
    registry().get(name).map(|build| build(vm))
}

fn build_module(vm: &mut Vm, name: &str, members: &[(&str, NativeFn)]) -> (Handle, Table) {
    let mut table = Table::new();
    for &(member, function) in members {
        let (key, native) = vm.make_native(member, function);
        table.insert(key, native);
    }
    (vm.heap.copy_string(name), table)
}

fn finish_module(vm: &mut Vm, name: Handle, table: Table) -> Handle {
    vm.heap.allocate(Obj::Module(ObjModule {
        name,
        path: name,
        table,
    }))
}

fn build_math(vm: &mut Vm) -> Handle {
    let (name, mut table) = build_module(
        vm,
        "Math",
        &[
            ("sqrt", math_sqrt as NativeFn),
            ("abs", math_abs),
            ("floor", math_floor),
            ("ceil", math_ceil),
            ("round", math_round),
            ("min", math_min),
            ("max", math_max),
        ],
    );
    let pi = vm.heap.copy_string("PI");
    table.insert(pi, Value::Number(std::f64::consts::PI));
    let e = vm.heap.copy_string("E");
    table.insert(e, Value::Number(std::f64::consts::E));
    finish_module(vm, name, table)
}

fn build_system(vm: &mut Vm) -> Handle {
    let (name, table) = build_module(
        vm,
        "System",
        &[
            ("clock", system_clock as NativeFn),
            ("time", system_time),
            ("readFile", system_read_file),
        ],
    );
    finish_module(vm, name, table)
}

// ---- Math -------------------------------------------------------------

fn unary_math(vm: &mut Vm, args: &[Value], name: &str, f: fn(f64) -> f64) -> Value {
    if args.len() != 2 {
        vm.native_error(format!(
            "{}() expected 1 argument but got {}.",
            name,
            args.len() - 1
        ));
        return Value::Empty;
    }
    match args[1].as_number() {
        Some(n) => Value::Number(f(n)),
        None => {
            let found = vm.heap.type_name(args[1]);
            vm.native_error(format!("{}() expected a number, got '{}'.", name, found));
            Value::Empty
        }
    }
}

fn math_sqrt(vm: &mut Vm, args: &[Value]) -> Value {
    unary_math(vm, args, "sqrt", f64::sqrt)
}

fn math_abs(vm: &mut Vm, args: &[Value]) -> Value {
    unary_math(vm, args, "abs", f64::abs)
}

fn math_floor(vm: &mut Vm, args: &[Value]) -> Value {
    unary_math(vm, args, "floor", f64::floor)
}

fn math_ceil(vm: &mut Vm, args: &[Value]) -> Value {
    unary_math(vm, args, "ceil", f64::ceil)
}

fn math_round(vm: &mut Vm, args: &[Value]) -> Value {
    unary_math(vm, args, "round", f64::round)
}

fn fold_math(vm: &mut Vm, args: &[Value], name: &str, f: fn(f64, f64) -> f64) -> Value {
    if args.len() < 2 {
        vm.native_error(format!("{}() expected at least 1 argument.", name));
        return Value::Empty;
    }
    let mut best = None;
    for &arg in &args[1..] {
        match arg.as_number() {
            Some(n) => best = Some(best.map_or(n, |b| f(b, n))),
            None => {
                let found = vm.heap.type_name(arg);
                vm.native_error(format!("{}() expected numbers, got '{}'.", name, found));
                return Value::Empty;
            }
        }
    }
    Value::Number(best.expect("at least one argument"))
}

fn math_min(vm: &mut Vm, args: &[Value]) -> Value {
    fold_math(vm, args, "min", f64::min)
}

fn math_max(vm: &mut Vm, args: &[Value]) -> Value {
    fold_math(vm, args, "max", f64::max)
}

// ---- System -----------------------------------------------------------

fn epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

/// Fractional seconds, for timing scripts.
fn system_clock(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Number(epoch_seconds())
}

/// Whole seconds since the epoch.
fn system_time(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Number(epoch_seconds().floor())
}

/// Returns a Result rather than raising: missing files are routine.
fn system_read_file(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        vm.native_error(format!(
            "readFile() expected 1 argument but got {}.",
            args.len() - 1
        ));
        return Value::Empty;
    }
    let path = match args[1] {
        Value::Obj(handle) => match vm.heap.get(handle) {
            Obj::String(s) => s.chars.to_string(),
            _ => {
                vm.native_error("readFile() expected a string path.");
                return Value::Empty;
            }
        },
        _ => {
            vm.native_error("readFile() expected a string path.");
            return Value::Empty;
        }
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let contents = Value::Obj(vm.heap.take_string(contents));
            ok_result(vm, contents)
        }
        Err(err) => err_result(vm, &format!("Could not read '{}': {}", path, err)),
    }
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
    fn math_functions_and_constants() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(&mut vm, "import Math; var out = Math.sqrt(9);"),
            Value::Number(3.0)
        );
        assert_eq!(
            eval(&mut vm, "import Math; var out = Math.min(3, 1, 2);"),
            Value::Number(1.0)
        );
        assert_eq!(
            eval(&mut vm, "import Math; var out = Math.floor(Math.PI);"),
            Value::Number(3.0)
        );
    }

    #[test]
    fn unknown_builtin_falls_through_to_files() {
        let mut vm = Vm::new();
        assert!(build_builtin(&mut vm, "NoSuchModule").is_none());
    }

    #[test]
    fn read_file_returns_error_result_for_missing_path() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(
                &mut vm,
                "import System; var out = System.readFile(\"/no/such/file\").success();"
            ),
            Value::Bool(false)
        );
    }

    #[test]
    fn imports_are_cached() {
        let mut vm = Vm::new();
        assert_eq!(
            eval(
                &mut vm,
                "import Math; import Math; var out = Math.abs(0 - 4);"
            ),
            Value::Number(4.0)
        );
    }
}
