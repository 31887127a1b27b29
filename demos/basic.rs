use std::env;
use std::error::Error;
use tessera::{IntoTypedRows, Session, SessionBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let uri = env::var("TESSERA_URI").unwrap_or_else(|_| "127.0.0.1:9042".to_string());

    println!("Connecting to {} ...", uri);

    let session: Session = SessionBuilder::new().known_node(uri).build().await?;

    session.query("CREATE KEYSPACE IF NOT EXISTS examples_ks WITH REPLICATION = {'class' : 'SimpleStrategy', 'replication_factor' : 1}", ()).await?;

    session
        .query(
            "CREATE TABLE IF NOT EXISTS examples_ks.basic (a int, b int, c text, primary key (a, b))",
            (),
        )
        .await?;

    session
        .query(
            "INSERT INTO examples_ks.basic (a, b, c) VALUES (?, ?, ?)",
            (3, 4, "def"),
        )
        .await?;

    let prepared = session
        .prepare("INSERT INTO examples_ks.basic (a, b, c) VALUES (?, 7, ?)")
        .await?;
    session.execute(&prepared, (42_i32, "I'm prepared!")).await?;

    // Rows can be parsed as tuples
    let rows = session
        .query("SELECT a, b, c FROM examples_ks.basic", ())
        .await?
        .rows()?;
    for row in rows.into_typed::<(i32, i32, String)>() {
        let (a, b, c) = row?;
        println!("a, b, c: {}, {}, {}", a, b, c);
    }

    let metrics = session.get_metrics();
    println!("Queries requested: {}", metrics.get_queries_num());

    Ok(())
}
