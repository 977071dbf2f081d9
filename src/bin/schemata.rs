use schemata::catalog::SchemaCatalog;
use schemata::config::{SchemataConfig, TREE_SPACE_PREFIX};
use schemata::manifest::load_catalog_dump;
use schemata::storage::tree_space::TreeSpaceRules;
use std::path::Path;

fn main() {
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
        "trees" => cmd_trees(&args[2..]),
        "verify" => cmd_verify(&args[2..]),
        "resolve" => cmd_resolve(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_trees(args: &[String]) -> Result<(), String> {
    let catalog = load_dump(args)?;
    for tree in catalog.tree_names() {
        println!("{tree}");
    }
    Ok(())
}

fn cmd_verify(args: &[String]) -> Result<(), String> {
    let catalog = load_dump(args)?;
    catalog
        .validate_references()
        .map_err(|e| format!("invariants: {e}"))?;
    println!(
        "ok\t{}\t{}\t{}\t{}",
        catalog.generation(),
        catalog.tables().count(),
        catalog.indexes().count(),
        catalog.sequences().count()
    );
    Ok(())
}

fn cmd_resolve(args: &[String]) -> Result<(), String> {
    let schema = parse_flag_value(args, "--schema").ok_or("--schema is required")?;
    let mut properties = Vec::new();
    for entry in parse_flag_values(args, "--treespace") {
        let (name, rule) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --treespace {entry}: expected name=glob:template"))?;
        properties.push((format!("{TREE_SPACE_PREFIX}{name}"), rule.to_string()));
    }
    for entry in parse_flag_values(args, "--property") {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --property {entry}: expected key=value"))?;
        properties.push((key.to_string(), value.to_string()));
    }
    let config = SchemataConfig::from_properties(properties).map_err(|e| format!("config: {e}"))?;
    let rules = TreeSpaceRules::from_config(&config);
    for rule in rules.rules() {
        println!("rule\t{}\t{}\t{}", rule.name, rule.pattern, rule.template);
    }
    match rules.resolve(&schema) {
        Some(resolution) => {
            println!(
                "resolved\t{}\t{}\t{}",
                schema, resolution.rule, resolution.volume
            );
            Ok(())
        }
        None => Err(format!("no tree space maps schema {schema}")),
    }
}

fn load_dump(args: &[String]) -> Result<SchemaCatalog, String> {
    let dump = parse_flag_value(args, "--dump").ok_or("--dump is required")?;
    let hmac_key = parse_hmac_key_hex(args)?;
    load_catalog_dump(Path::new(&dump), hmac_key.as_deref()).map_err(|e| format!("load dump: {e}"))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_flag_values(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

fn parse_hmac_key_hex(args: &[String]) -> Result<Option<Vec<u8>>, String> {
    let Some(hex_key) = parse_flag_value(args, "--hmac-key-hex") else {
        return Ok(None);
    };
    hex::decode(hex_key)
        .map(Some)
        .map_err(|e| format!("invalid --hmac-key-hex: {e}"))
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  schemata trees --dump <dump-dir> [--hmac-key-hex <hex>]");
    eprintln!("  schemata verify --dump <dump-dir> [--hmac-key-hex <hex>]");
    eprintln!(
        "  schemata resolve --schema <name> [--treespace <name>=<glob>:<template>]... [--property <key>=<value>]..."
    );
}
