//! Diagnostic shell over the checkpointed state
//!
//! Read-only: loads the checkpoint the same way the collector would and
//! answers a few inspection commands on stdin. Useful for poking at totals
//! without touching the running daemon's files.

use anyhow::Result;
use std::io::{self, BufRead, Write};

use crate::aggregate::AggregatorState;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::snapshot::{render_geo_tree, GeoNode};

pub fn run(config: &Config) -> Result<()> {
    let store = CheckpointStore::new(config.paths.checkpoint.clone());
    let Some((state, last)) = store.load() else {
        println!("No checkpoint at {}.", config.paths.checkpoint.display());
        return Ok(());
    };
    println!("Loaded state for {} (schema v{}).", last, state.schema_version);
    println!("Commands: state, history, tree, countries, help, quit");

    let stdin = io::stdin();
    loop {
        print!("ember> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "state" => {
                println!("total:   {}", state.total);
                println!("history: {} entries", state.history.len());
                println!("last:    {}", last);
            }
            "history" => {
                for (minute, total) in &state.history {
                    println!("{}  {}", minute, total);
                }
            }
            "tree" => print_tree(&state),
            "countries" => print_countries(&state),
            "help" => println!("Commands: state, history, tree, countries, help, quit"),
            "quit" | "exit" => break,
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }
    Ok(())
}

/// Continents and countries with their rolled-up totals, same numbers the
/// geo snapshot would carry.
fn print_tree(state: &AggregatorState) {
    let GeoNode::Branch { total, children, .. } = render_geo_tree(&state.tree) else {
        return;
    };
    println!("world  {}", total);
    for continent in &children {
        let GeoNode::Branch { label, total, children } = continent else { continue };
        println!("  {}  {}", label.as_deref().unwrap_or("?"), total);
        for country in children {
            let GeoNode::Branch { label, total, .. } = country else { continue };
            println!("    {}  {}", label.as_deref().unwrap_or("?"), total);
        }
    }
}

fn print_countries(state: &AggregatorState) {
    let mut totals: Vec<(String, u64)> = Vec::new();
    for countries in state.tree.values() {
        for (country, regions) in countries {
            let total: u64 = regions.values().flat_map(|cities| cities.values()).sum();
            if total > 0 {
                totals.push((country.clone(), total));
            }
        }
    }
    totals.sort_by(|a, b| b.1.cmp(&a.1));
    for (country, total) in totals {
        println!("{}  {}", country, total);
    }
}
