//! merkledb CLI - dump utility for merkledb databases
//!
//! Walks the raw backing store of a database and prints every entry
//! through the default formatters.

use clap::{Parser, Subcommand};
use merkledb::{Error, FileStore, KvStore, Tree, DEFAULT_CACHE_SIZE};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "merkledb")]
#[command(about = "Versioned authenticated key-value store on a balanced Merkle tree")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump all of the data in an underlying persistent database
    Dump {
        /// Database name (file name without the .db suffix)
        #[arg(short, long, default_value = "merkleeyes")]
        name: String,

        /// Directory containing the database
        #[arg(short, long, default_value = "./")]
        path: PathBuf,

        /// Node cache capacity
        #[arg(short, long, default_value_t = DEFAULT_CACHE_SIZE)]
        cachesize: usize,

        /// Store backend type
        #[arg(short, long, default_value = "file")]
        dbtype: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Dump {
            name,
            path,
            cachesize,
            dbtype,
        } => dump_database(&name, &path, cachesize, &dbtype),
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(1);
    }
}

fn dump_database(
    name: &str,
    path: &PathBuf,
    cachesize: usize,
    dbtype: &str,
) -> merkledb::Result<()> {
    let db_path = path.join(format!("{}.db", name));
    if !db_path.exists() {
        return Err(Error::InvalidFile(format!(
            "no existing database: {}",
            db_path.display()
        )));
    }

    println!("Dumping DB {} ({})...", name, dbtype);

    let store: Arc<dyn KvStore> = match dbtype {
        "file" => Arc::new(FileStore::open(&db_path)?),
        other => {
            return Err(Error::InvalidFile(format!(
                "unknown dbtype: {}",
                other
            )))
        }
    };

    let tree = Tree::new(cachesize, store);
    tree.dump(None)
}
