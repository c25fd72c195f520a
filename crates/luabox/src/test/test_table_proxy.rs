// Tests for table proxies, callable handles and the registry
use crate::*;

fn table_from(sandbox: &mut Sandbox, source: &str) -> TableProxy {
    sandbox
        .exec(source)
        .unwrap()
        .remove(0)
        .into_table()
        .unwrap()
}

#[test]
fn test_key_normalization() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(
        &mut sandbox,
        "return { x = 'b', c = {x = 5}, x = 99, [2] = 1, [1] = 66 }",
    );

    assert_eq!(t.get("x").unwrap(), Value::Integer(99));
    assert_eq!(t.get(1).unwrap(), Value::Integer(66));
    assert_eq!(t.get(2).unwrap(), Value::Integer(1));
    assert_eq!(t.get(2.0).unwrap(), Value::Integer(1));
    assert_eq!(t.get("2").unwrap(), Value::Nil);
    assert_eq!(t.get(2.5).unwrap(), Value::Nil);

    let c = t.get("c").unwrap().into_table().unwrap();
    assert_eq!(c.get("x").unwrap(), Value::Integer(5));

    assert_eq!(t.len().unwrap(), 2);

    let mut keys: Vec<String> = t
        .keys()
        .unwrap()
        .map(|k| k.unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["1", "2", "c", "x"]);
}

#[test]
fn test_float_and_text_keys_on_write() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = sandbox.create_table().unwrap();
    t.set(3.0, "three").unwrap();
    t.set("3", "text three").unwrap();
    t.set(-0.0, "zero").unwrap();
    t.set(0.5, "half").unwrap();

    assert_eq!(t.get(3).unwrap(), Value::from("three"));
    assert_eq!(t.get("3").unwrap(), Value::from("text three"));
    assert_eq!(t.get(0).unwrap(), Value::from("zero"));
    assert_eq!(t.get(0.5).unwrap(), Value::from("half"));
    assert_eq!(t.pairs().unwrap().len(), 4);
}

#[test]
fn test_nan_keys() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = sandbox.create_table().unwrap();
    assert!(matches!(
        t.set(f64::NAN, 1),
        Err(LuaError::UnsupportedValue(_))
    ));
    assert_eq!(t.get(f64::NAN).unwrap(), Value::Nil);
}

#[test]
fn test_writes_are_visible_both_ways() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(&mut sandbox, "config = { level = 1 } return config");

    t.set("level", 2).unwrap();
    t.set("name", "proxy").unwrap();
    assert_eq!(
        sandbox.exec("return config.level, config.name").unwrap(),
        vec![Value::Integer(2), Value::from("proxy")]
    );

    sandbox.exec("config.level = 3; config.name = nil").unwrap();
    assert_eq!(t.get("level").unwrap(), Value::Integer(3));
    assert!(!t.contains_key("name").unwrap());

    // nested proxies can be stored as values
    let inner = sandbox.create_table().unwrap();
    inner.set(1, "nested").unwrap();
    t.set("inner", inner).unwrap();
    assert_eq!(
        sandbox.exec("return config.inner[1]").unwrap(),
        vec![Value::from("nested")]
    );
}

#[test]
fn test_identity_dedup_and_refcount() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    sandbox.exec("t = {}").unwrap();

    let a = sandbox.get_global("t").unwrap().into_table().unwrap();
    let b = sandbox.get_global("t").unwrap().into_table().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.handle(), b.handle());
    let handle = a.handle();
    assert_eq!(sandbox.refcount(handle), Some(2));

    let c = a.clone();
    assert_eq!(sandbox.refcount(handle), Some(3));

    drop(a);
    drop(c);
    assert_eq!(sandbox.refcount(handle), Some(1));
    assert!(b.is_valid());

    drop(b);
    assert_eq!(sandbox.refcount(handle), None);

    // a fresh promotion gets a new handle
    let again = sandbox.get_global("t").unwrap().into_table().unwrap();
    assert_ne!(again.handle(), handle);
}

#[test]
fn test_distinct_tables_are_distinct_proxies() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let results = sandbox.exec("return {}, {}").unwrap();
    assert_ne!(results[0], results[1]);
}

#[test]
fn test_invalid_handle_after_release() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(&mut sandbox, "return { 1 }");
    let handle = t.handle();

    let again = sandbox.table_from_handle(handle).unwrap();
    assert_eq!(sandbox.refcount(handle), Some(2));
    assert_eq!(again.get(1).unwrap(), Value::Integer(1));
    drop(again);
    drop(t);

    assert_eq!(
        sandbox.table_from_handle(handle).unwrap_err(),
        LuaError::InvalidHandle(handle)
    );
    assert_eq!(
        sandbox.callable_from_handle(handle).unwrap_err(),
        LuaError::InvalidHandle(handle)
    );
}

#[test]
fn test_handle_kind_is_checked() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let f = sandbox
        .exec("return function() return 1 end")
        .unwrap()
        .remove(0)
        .into_callable()
        .unwrap();
    assert!(sandbox.table_from_handle(f.handle()).is_err());
    let g = sandbox.callable_from_handle(f.handle()).unwrap();
    assert_eq!(g.call1(&[]).unwrap(), Value::Integer(1));
}

#[test]
fn test_proxy_keeps_table_alive() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(&mut sandbox, "held = { a = 1 } return held");
    sandbox.exec("held = nil collectgarbage() collectgarbage()").unwrap();
    assert_eq!(t.get("a").unwrap(), Value::Integer(1));
}

#[test]
fn test_raw_access_ignores_metamethods() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(
        &mut sandbox,
        r#"
        log = {}
        return setmetatable({}, {
            __index = function() return 'meta' end,
            __newindex = function(t, k, v) log[#log + 1] = k end,
            __len = function() return 100 end,
        })
    "#,
    );
    assert_eq!(t.get("missing").unwrap(), Value::Nil);
    t.set("k", 1).unwrap();
    assert_eq!(t.get("k").unwrap(), Value::Integer(1));
    assert_eq!(t.len().unwrap(), 0);
    assert_eq!(sandbox.exec("return #log").unwrap(), vec![Value::Integer(0)]);
}

#[test]
fn test_keys_iterator_is_lazy_and_restartable() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(&mut sandbox, "return { 10, 20, 30 }");

    let mut keys = t.keys().unwrap();
    assert_eq!(keys.next().unwrap().unwrap(), Value::Integer(1));
    let rest: Vec<Value> = keys.by_ref().map(|k| k.unwrap()).collect();
    assert_eq!(rest, vec![Value::Integer(2), Value::Integer(3)]);
    assert!(keys.next().is_none());

    keys.rewind();
    assert_eq!(keys.count(), 3);

    let empty = sandbox.create_table().unwrap();
    assert!(empty.is_empty().unwrap());
    assert_eq!(empty.keys().unwrap().count(), 0);
}

#[test]
fn test_assigning_existing_keys_while_iterating() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(&mut sandbox, "return { a = 1, b = 2, c = 3 }");
    for key in t.keys().unwrap() {
        let key = TableKey::try_from(key.unwrap()).unwrap();
        let old = t.get(key.clone()).unwrap().as_integer().unwrap();
        t.set(key, old * 10).unwrap();
    }
    let mut values: Vec<i64> = t
        .pairs()
        .unwrap()
        .into_iter()
        .map(|(_, v)| v.as_integer().unwrap())
        .collect();
    values.sort();
    assert_eq!(values, vec![10, 20, 30]);
}

#[test]
fn test_push_appends() {
    let sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = sandbox.create_table().unwrap();
    t.push("a").unwrap();
    t.push("b").unwrap();
    assert_eq!(t.len().unwrap(), 2);
    assert_eq!(t.get(2).unwrap(), Value::from("b"));
}

#[test]
fn test_globals_proxy() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let globals = sandbox.globals().unwrap();
    globals.set("from_host", 5).unwrap();
    assert_eq!(
        sandbox.exec("return from_host + 1").unwrap(),
        vec![Value::Integer(6)]
    );
    assert!(globals.contains_key("print").unwrap());
}

#[test]
fn test_callable_ref_call() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let f = sandbox
        .exec("return function(a, b) return a + b, a * b end")
        .unwrap()
        .remove(0)
        .into_callable()
        .unwrap();

    let args = [Value::Integer(2), Value::Integer(3)];
    assert_eq!(
        f.call(&args, ResultMode::All).unwrap(),
        vec![Value::Integer(5), Value::Integer(6)]
    );
    assert_eq!(f.call1(&args).unwrap(), Value::Integer(5));
    assert_eq!(
        f.call(&args, ResultMode::Exactly(3)).unwrap(),
        vec![Value::Integer(5), Value::Integer(6), Value::Nil]
    );
    assert_eq!(
        sandbox.call(&f, &args, ResultMode::Exactly(1)).unwrap(),
        vec![Value::Integer(5)]
    );

    let err = f.call(&[Value::from("x"), Value::Nil], ResultMode::All);
    assert!(matches!(err, Err(LuaError::RuntimeError { .. })));
}

#[test]
fn test_callable_table() {
    let mut sandbox = Sandbox::new(SandboxOption::default()).unwrap();
    let t = table_from(
        &mut sandbox,
        "return setmetatable({ factor = 2 }, { __call = function(self, x) return x * self.factor end })",
    );
    assert_eq!(
        t.call(&[Value::Integer(21)], ResultMode::All).unwrap(),
        vec![Value::Integer(42)]
    );
    assert_eq!(
        sandbox
            .call(&t, &[Value::Integer(5)], ResultMode::All)
            .unwrap(),
        vec![Value::Integer(10)]
    );

    let plain = sandbox.create_table().unwrap();
    let err = plain.call(&[], ResultMode::All).unwrap_err();
    assert!(err.to_string().contains("attempt to call a table value"));
}
