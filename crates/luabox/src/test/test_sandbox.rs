// Tests for sandbox construction, loading and error isolation
use crate::*;

#[test]
fn test_exec_returns_results() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let results = sandbox.exec("return 1 + 1, 'two', true").unwrap();
    assert_eq!(
        results,
        vec![Value::Integer(2), Value::from("two"), Value::Bool(true)]
    );
    assert_eq!(sandbox.top_count(), 0);
}

#[test]
fn test_zero_memory_limit_is_init_error() {
    let err = Sandbox::with_limits(Some(0), None).unwrap_err();
    assert!(matches!(err, LuaError::InitError(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_memory_limit_below_bootstrap_is_init_error() {
    let err = Sandbox::with_limits(Some(1024), None).unwrap_err();
    assert!(matches!(err, LuaError::InitError(_)));
}

#[test]
fn test_compile_error_reports_line() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let err = sandbox.load("local x = 1\nlocal = 5").unwrap_err();
    match err {
        LuaError::CompileError { message, line } => {
            assert_eq!(line, Some(2));
            assert!(message.starts_with("chunk:2:"), "message: {message}");
        }
        other => panic!("expected compile error, got {other:?}"),
    }
}

#[test]
fn test_chunk_name_appears_in_errors() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let err = sandbox.load_named("return +", "config.lua").unwrap_err();
    assert!(err.to_string().contains("config.lua:1:"), "{err}");

    // ':' would break line parsing and is replaced
    let chunk = sandbox.load_named("return 1", "a:b").unwrap();
    assert_eq!(chunk.name(), "a_b");
}

#[test]
fn test_binary_chunks_are_rejected() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let err = sandbox.load(b"\x1bLua\x54\x00garbage".as_slice()).unwrap_err();
    assert!(matches!(err, LuaError::CompileError { .. }), "{err:?}");
}

#[test]
fn test_load_does_not_run() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let chunk = sandbox.load("ran = true").unwrap();
    assert_eq!(sandbox.get_global("ran").unwrap(), Value::Nil);
    sandbox.call(&chunk, &[], ResultMode::All).unwrap();
    assert_eq!(sandbox.get_global("ran").unwrap(), Value::Bool(true));
}

#[test]
fn test_load_file_missing() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let err = sandbox.load_file("/definitely/not/here.lua").unwrap_err();
    assert!(matches!(err, LuaError::Io { .. }));
}

#[test]
fn test_load_file() {
    let path = std::env::temp_dir().join(format!("luabox_test_{}.lua", std::process::id()));
    std::fs::write(&path, "return ... , 'file'").unwrap();

    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let chunk = sandbox.load_file(&path).unwrap();
    let results = sandbox
        .call(&chunk, &[Value::Integer(7)], ResultMode::All)
        .unwrap();
    assert_eq!(results, vec![Value::Integer(7), Value::from("file")]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_runtime_error_does_not_poison() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();

    let err = sandbox.exec("error('boom')").unwrap_err();
    match &err {
        LuaError::RuntimeError { message, .. } => assert!(message.contains("boom"), "{message}"),
        other => panic!("expected runtime error, got {other:?}"),
    }
    assert!(!err.is_fatal());

    let err = sandbox.exec("local x = nil; return x.y").unwrap_err();
    assert!(err.to_string().contains("attempt to index"), "{err}");

    assert!(sandbox.exec("error({ code = 1 })").is_err());

    assert_eq!(sandbox.exec("return 40 + 2").unwrap(), vec![Value::Integer(42)]);
}

#[test]
fn test_guest_pcall_still_works() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let results = sandbox
        .exec("local ok, err = pcall(error, 'inner') return ok, err")
        .unwrap();
    assert_eq!(results, vec![Value::Bool(false), Value::from("inner")]);
}

#[test]
fn test_loaders_are_removed() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let results = sandbox
        .exec("return load, loadfile, dofile, require, io, os, debug, package, coroutine")
        .unwrap();
    assert_eq!(results.len(), 9);
    assert!(results.iter().all(Value::is_nil), "{results:?}");
}

#[test]
fn test_lib_sets() {
    let mut safe = Sandbox::new(SandboxOption::default()).unwrap();
    assert_eq!(
        safe.exec("return string.rep('ab', 2), math.max(1, 5), #table.pack(1, 2), utf8.char(72)")
            .unwrap(),
        vec![
            Value::from("abab"),
            Value::Integer(5),
            Value::Integer(2),
            Value::from("H"),
        ]
    );

    let mut minimal = Sandbox::new(SandboxOption::default().with_libs(LibSet::Minimal)).unwrap();
    assert_eq!(
        minimal.exec("return string, math, type(print)").unwrap(),
        vec![Value::Nil, Value::Nil, Value::from("function")]
    );
}

#[test]
fn test_globals_roundtrip() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    sandbox.set_global("greeting", "hello").unwrap();
    sandbox.set_global("count", 3).unwrap();
    assert_eq!(
        sandbox.exec("return greeting .. ' world', count * 2").unwrap(),
        vec![Value::from("hello world"), Value::Integer(6)]
    );

    sandbox.exec("answer = 42").unwrap();
    assert_eq!(sandbox.get_global("answer").unwrap(), Value::Integer(42));
    assert_eq!(sandbox.get_global("missing").unwrap(), Value::Nil);
}

#[test]
fn test_sandboxes_are_isolated() {
    let mut a = Sandbox::new(SandboxOption::default()).unwrap();
    let mut b = Sandbox::new(SandboxOption::default()).unwrap();
    a.exec("shared = 'a'").unwrap();
    assert_eq!(b.exec("return shared").unwrap(), vec![Value::Nil]);
}

#[test]
fn test_sandboxes_on_separate_threads() {
    let workers: Vec<_> = (0..4i64)
        .map(|i| {
            std::thread::spawn(move || {
                let mut sandbox = Sandbox::with_limits(Some(8 << 20), Some(1_000_000)).unwrap();
                if i == 0 {
                    // one runaway script must not disturb the others
                    let err = sandbox.exec("while true do end").unwrap_err();
                    assert_eq!(err, LuaError::BudgetExceeded(BudgetKind::Steps));
                    return -1;
                }
                let results = sandbox
                    .exec(format!(
                        "local s = 0 for j = 1, 100 do s = s + j end return s + {i}"
                    ))
                    .unwrap();
                results[0].as_integer().unwrap()
            })
        })
        .collect();

    let totals: Vec<i64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(totals, vec![-1, 5051, 5052, 5053]);
}

#[test]
fn test_close_with_live_proxy() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let table = sandbox
        .exec("return { answer = 42 }")
        .unwrap()
        .remove(0)
        .into_table()
        .unwrap();
    sandbox.close();
    // the proxy keeps the interpreter alive
    assert_eq!(table.get("answer").unwrap(), Value::Integer(42));
}

#[test]
fn test_restricted_preset() {
    let sandbox = Sandbox::new(SandboxOption::restricted()).unwrap();
    assert_eq!(
        sandbox.memory_limit(),
        Some(crate::lua_vm::lua_limits::RESTRICTED_MEMORY_LIMIT)
    );
    assert_eq!(
        sandbox.step_limit(),
        Some(crate::lua_vm::lua_limits::RESTRICTED_STEP_LIMIT)
    );
    assert_eq!(
        sandbox.checkpoint_interval(),
        crate::lua_vm::lua_limits::DEFAULT_CHECKPOINT_INTERVAL
    );
}
