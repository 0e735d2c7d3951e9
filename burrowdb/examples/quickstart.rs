//! Minimal end-to-end tour: open a connection, register a model, save a
//! document, and read it back. Run with `RUST_LOG=debug` to watch the
//! lifecycle.

use std::sync::Arc;

use burrowdb::driver::memory::MemoryDriver;
use burrowdb::{ConnectConfig, CustomField, FieldSpec, Result, SchemaSpec};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let driver = Arc::new(MemoryDriver::new());
    let conn = burrowdb::connect(driver, ConnectConfig::default());
    conn.when_ready().await?;

    let spec = SchemaSpec::new()
        .field("name", FieldSpec::String)
        .field("age", FieldSpec::Number)
        .field(
            "dog",
            FieldSpec::nested(SchemaSpec::new().field("name", FieldSpec::String).field(
                "age",
                FieldSpec::custom(
                    CustomField::new(f64::NAN)
                        .on_store(|v| v.as_f64().map(|n| (n * 7.0).into()))
                        .on_load(|v| v.as_f64().map(|n| (n / 7.0).into())),
                ),
            )),
        );
    let people = conn.register_model("people", &spec)?;

    let mut john = people.create();
    john.set("name", "John")?;
    john.set("age", 35)?;
    john.set("dog.name", "Sparks")?;
    john.set("dog.age", 2)?;
    john.save().await?;
    println!("saved with id {:?}", john.id());

    let query = serde_yaml::from_str("name: John").expect("literal query");
    let found = people.find_one(query).await?.expect("just saved");
    println!(
        "{} has a dog named {} aged {:?} (stored in dog years)",
        found.get("name")?.as_str().unwrap_or_default(),
        found.get("dog.name")?.as_str().unwrap_or_default(),
        found.get("dog.age")?,
    );

    conn.close();
    Ok(())
}
