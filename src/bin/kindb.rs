use kindb::catalog::MemorySchema;
use kindb::catalog::schema::{Cardinality, ClassDef, PropertyDescriptor};
use kindb::catalog::types::{Kind, RefType, Reference};
use kindb::config::KindbConfig;
use kindb::network::InMemoryPeers;
use kindb::permission::{OwnerOnly, Principal};
use kindb::query::{AnalyticsProps, MetaProperty, MetaQuery, StatisticalAnalysis, analytics_hash};
use kindb::storage::MemoryConnector;
use kindb::{Collaborators, KindbInstance, ObjectCreate};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "fingerprint" => cmd_fingerprint(&args[2..]),
        "demo" => cmd_demo(),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

/// `fingerprint <Class> [<property> <Statistic>]... [--count] [--kind thing|action]`
fn cmd_fingerprint(args: &[String]) -> Result<(), String> {
    let class_name = args.first().ok_or("class name is required")?;
    let kind = match parse_flag_value(args, "--kind").as_deref() {
        None | Some("thing") => Kind::Thing,
        Some("action") => Kind::Action,
        Some(other) => return Err(format!("unknown kind: {other}")),
    };
    let include_meta_count = args.iter().any(|a| a == "--count");

    let positional: Vec<&String> = args[1..]
        .iter()
        .scan(false, |skip_next, arg| {
            let skip = *skip_next;
            *skip_next = arg == "--kind";
            Some((skip, arg))
        })
        .filter(|(skip, arg)| !skip && !arg.starts_with("--"))
        .map(|(_, arg)| arg)
        .collect();
    if positional.len() % 2 != 0 {
        return Err("properties must be given as <property> <Statistic> pairs".into());
    }
    let mut properties: Vec<MetaProperty> = Vec::new();
    for pair in positional.chunks(2) {
        let analysis = parse_analysis(pair[1])?;
        match properties.last_mut() {
            Some(last) if last.name == *pair[0] => last.statistical_analyses.push(analysis),
            _ => properties.push(MetaProperty::new(pair[0].as_str(), vec![analysis])),
        }
    }

    let query = MetaQuery {
        kind,
        class_name: class_name.clone(),
        filters: None,
        include_meta_count,
        properties,
        analytics: AnalyticsProps {
            use_analytics_engine: true,
            force_recalculate: false,
        },
    };
    let hash = analytics_hash(&query).map_err(|e| e.to_string())?;
    println!("{hash}");
    Ok(())
}

/// Runs a create, a reference edit and a delete against in-memory
/// collaborators and prints the resulting history.
fn cmd_demo() -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("runtime: {e}"))?;
    runtime.block_on(async {
        let schema = MemorySchema::new()
            .with_class(
                ClassDef::new(Kind::Thing, "City")
                    .with_property(PropertyDescriptor::primitive("name", "string"))
                    .with_property(PropertyDescriptor::reference(
                        "sisters",
                        &["City"],
                        Cardinality::Many,
                    )),
            )
            .map_err(|e| e.to_string())?;
        let peers = Arc::new(InMemoryPeers::new());
        let remote = Uuid::new_v4();
        peers.host("peerA", remote, Kind::Thing, "Town");
        let collaborators = Collaborators::new(Arc::new(MemoryConnector::new()), Arc::new(schema))
            .with_peers(peers)
            .with_authorizer(Arc::new(OwnerOnly));
        let db = KindbInstance::open(KindbConfig::development(), collaborators)
            .map_err(|e| e.to_string())?;
        let principal = Principal::new(Uuid::new_v4());

        let mut created = db
            .create(
                &principal,
                Kind::Thing,
                ObjectCreate {
                    class: "City".into(),
                    context: String::new(),
                    schema: json!({ "name": "Amsterdam" }),
                    async_write: false,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        created.settle().await;
        let id = created.id().ok_or("create returned no object")?;

        let mut edited = db
            .add_reference(
                &principal,
                Kind::Thing,
                id,
                "sisters",
                Reference::network("peerA", remote, RefType::Thing),
            )
            .await
            .map_err(|e| e.to_string())?;
        for (label, outcome) in edited.settle().await {
            println!("{label}: {outcome:?}");
        }

        let mut deleted = db
            .delete(&principal, Kind::Thing, id)
            .await
            .map_err(|e| e.to_string())?;
        for (label, outcome) in deleted.settle().await {
            println!("{label}: {outcome:?}");
        }

        let history = db
            .history(&principal, Kind::Thing, id)
            .await
            .map_err(|e| e.to_string())?;
        let entries: Vec<_> = history
            .entries
            .iter()
            .map(|e| json!({ "kind": e.kind, "archivedAt": e.archived_at_unix, "object": e.object }))
            .collect();
        let rendered = json!({ "id": id, "deleted": history.deleted, "entries": entries });
        println!(
            "{}",
            serde_json::to_string_pretty(&rendered).map_err(|e| e.to_string())?
        );
        db.shutdown().await.map_err(|e| e.to_string())
    })
}

fn parse_analysis(raw: &str) -> Result<StatisticalAnalysis, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown statistic: {raw}"))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

fn print_usage() {
    eprintln!(
        "usage:
  kindb fingerprint <Class> [<property> <Statistic>]... [--count] [--kind thing|action]
  kindb demo"
    );
}
