//! Runs a few collector scenarios. Use `RUST_LOG=info` to see one line per
//! collection.

use heapyard::{CollectorError, Context};

fn preserved() -> Result<(), CollectorError> {
    let mut context = Context::new();
    context.push_integer(1)?;
    context.push_integer(2)?;
    context.collect();

    assert_eq!(context.object_count(), 2, "should have preserved objects");
    Ok(())
}

fn unreached() -> Result<(), CollectorError> {
    let mut context = Context::new();
    context.push_integer(1)?;
    context.push_integer(2)?;
    context.pop()?;
    context.pop()?;
    context.collect();

    assert_eq!(context.object_count(), 0, "should have collected objects");
    Ok(())
}

fn nested() -> Result<(), CollectorError> {
    let mut context = Context::new();
    context.push_integer(1)?;
    context.push_integer(2)?;
    context.push_pair()?;
    context.push_integer(3)?;
    context.push_integer(4)?;
    context.push_pair()?;
    let root = context.push_pair()?;
    context.collect();

    assert_eq!(context.object_count(), 7, "should have reached objects");
    println!("  root: {}", unsafe { root.render() });
    Ok(())
}

fn cycles() -> Result<(), CollectorError> {
    let mut context = Context::new();
    context.push_integer(1)?;
    context.push_integer(2)?;
    let a = context.push_pair()?;
    context.push_integer(3)?;
    context.push_integer(4)?;
    let b = context.push_pair()?;

    // Cycle between a and b, 2 and 4 become unreachable.
    unsafe {
        a.set_right(b);
        b.set_right(a);
    }
    context.collect();

    assert_eq!(context.object_count(), 4, "should have collected objects");
    println!("  a: {}", unsafe { a.render() });
    Ok(())
}

fn churn() -> Result<(), CollectorError> {
    let mut context = Context::new();

    for i in 0..1000 {
        for _ in 0..20 {
            context.push_integer(i)?;
        }
        for _ in 0..20 {
            context.pop()?;
        }
    }

    let collection = context.delete();
    println!("  freed {} objects on delete", collection.collected);
    Ok(())
}

fn main() -> Result<(), CollectorError> {
    env_logger::init();

    let scenarios: [(&str, fn() -> Result<(), CollectorError>); 5] = [
        ("Objects on stack are preserved", preserved),
        ("Unreached objects are collected", unreached),
        ("Reach nested objects", nested),
        ("Handle cycles", cycles),
        ("Push and pop churn", churn),
    ];

    for (name, scenario) in scenarios {
        println!("{name}");
        scenario()?;
    }

    Ok(())
}
