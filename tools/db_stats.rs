use std::env;
use std::fs;
use std::path::Path;

use query::Query;
use store::Store;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let db_path = args
        .next()
        .or_else(|| env::var("MEDIA_DB").ok())
        .ok_or("MEDIA_DB not set and no path argument")?;
    let query_path = args.next();

    let store = Store::new();
    store.load(Path::new(&db_path))?;

    let stats = store.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(query_path) = query_path {
        let xml = fs::read_to_string(&query_path)?;
        let query = Query::from_xml(&xml, store.pool())?;
        let matches = store.query_sync(&query);
        println!("query matched {} entries:", matches.len());
        for entry in &matches {
            println!("  {}", entry.location());
        }
    }

    Ok(())
}
