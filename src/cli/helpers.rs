//! Shared helper functions for CLI commands
//!
//! Commands that turn entity references into directories all run the same
//! pipeline: discover the project, load configuration, open a session over
//! the configured records, build the context tree and load the schema.

use console::style;
use miette::{IntoDiagnostic, Result};
use serde_json::{json, Map, Value as JsonValue};
use tabled::{builder::Builder, settings::Style};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::{Config, ContextTree, Entity, EntityKey, MemoryStore, PathCache, Project, Session};
use crate::schema::{Schema, SchemaRegistry};

/// Find the project named by `--project`, or the one around the current directory
pub fn project(global: &GlobalOpts) -> Result<Project> {
    let found = match &global.project {
        Some(path) => Project::discover_from(path),
        None => Project::discover(),
    };
    found.map_err(|e| miette::miette!("{}", e))
}

/// Session over the configured records file, if any
pub fn session(config: &Config) -> Result<Session> {
    let session = match &config.records {
        Some(path) => {
            let store = MemoryStore::load(path)
                .map_err(|e| miette::miette!("failed to load records from {}: {}", path.display(), e))?;
            tracing::debug!(records = store.len(), path = %path.display(), "loaded record store");
            Session::with_store(store)
        }
        None => Session::new(),
    };
    Ok(session.with_parent_fields(config.parent_fields()))
}

pub fn parse_key(raw: &str) -> Result<EntityKey> {
    raw.parse::<EntityKey>()
        .map_err(|e| miette::miette!("invalid entity '{}': {}", raw, e))
}

/// Resolve `Type:id` arguments to session entities
///
/// With a record store every record is loaded in full; without one the
/// entities only carry their type and id.
pub fn load_entities(session: &mut Session, raw: &[String]) -> Result<Vec<Entity>> {
    let mut entities = Vec::with_capacity(raw.len());
    for item in raw {
        let key = parse_key(item)?;
        let entity = if session.store().is_some() {
            session.load(&key).into_diagnostic()?
        } else {
            session
                .merge_json(&json!({"type": key.entity_type, "id": key.id}))
                .into_diagnostic()?
        };
        entities.push(entity);
    }
    Ok(entities)
}

/// Everything needed to render a structure for a set of entities
pub struct Workspace {
    pub project: Project,
    pub config: Config,
    pub session: Session,
    pub tree: ContextTree,
    pub schema: Schema,
    pub cache: PathCache,
}

impl Workspace {
    pub fn prepare(global: &GlobalOpts, raw: &[String], schema: Option<&str>) -> Result<Self> {
        let project = project(global)?;
        let config = Config::load_for(Some(&project));
        let mut session = session(&config)?;

        let entities = load_entities(&mut session, raw)?;
        let tree = ContextTree::build(&mut session, &entities).into_diagnostic()?;
        let nodes: Vec<Entity> = tree.iter().map(|id| tree.entity(id)).collect();
        session.load_all(&nodes).into_diagnostic()?;

        let root_type = session
            .entity_type(tree.entity(tree.root()))
            .unwrap_or_default()
            .to_string();
        let name = schema.unwrap_or_else(|| config.schema());
        let dir = SchemaRegistry::for_project(Some(&project), &config).resolve(name)?;
        let schema = Schema::load(&dir, &root_type, &config.template_ignore())?;

        let cache = PathCache::open(&project)?;
        Ok(Self {
            project,
            config,
            session,
            tree,
            schema,
            cache,
        })
    }
}

/// Print rows in the requested format
pub fn print_rows(format: OutputFormat, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    match format.resolve() {
        OutputFormat::Json | OutputFormat::Yaml => {
            let objects: Vec<JsonValue> = rows
                .iter()
                .map(|row| {
                    let mut obj = Map::new();
                    for (header, value) in headers.iter().zip(row) {
                        obj.insert(header.to_string(), JsonValue::String(value.clone()));
                    }
                    JsonValue::Object(obj)
                })
                .collect();
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&objects).into_diagnostic()?);
            } else {
                print!("{}", serde_yml::to_string(&objects).into_diagnostic()?);
            }
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", style("(none)").dim());
                return Ok(());
            }
            let mut builder = Builder::default();
            builder.push_record(headers.iter().copied());
            for row in rows {
                builder.push_record(row.iter().map(String::as_str));
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
        _ => {
            for row in rows {
                println!("{}", row.join("\t"));
            }
        }
    }
    Ok(())
}

/// Display form of an entity's id
pub fn id_text(key: Option<EntityKey>) -> String {
    key.map(|k| k.id.to_string()).unwrap_or_else(|| "-".to_string())
}
