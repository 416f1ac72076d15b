//! s3mirror - command line access to the local object cache
//!
//! Thin wrapper over the library; configuration comes from the
//! `S3MIRROR_*` environment variables.

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use s3mirror::{BatchCoordinator, CacheEngine, ContentAddressedStore, MirrorConfig, Refresh};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Fetch one or more objects into the mirror
    Get {
        paths: Vec<String>,
        refresh: Option<Refresh>,
    },
    /// Load a value and print it as JSON
    CatJson {
        path: String,
        refresh: Option<Refresh>,
    },
    /// Upload a local file
    Put { local: PathBuf, remote: String },
    /// List objects under a prefix
    Ls { prefix: String, recursive: bool },
    /// Check whether an object exists
    Exists { path: String },
    /// Create a bucket
    Mb { bucket: String },
    /// Read a key-value record
    KvGet { namespace: String, key: String },
    /// Write a key-value record
    KvPut {
        namespace: String,
        key: String,
        value: String,
        strict: bool,
    },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"s3mirror - local cache for S3-compatible object stores

USAGE:
    s3mirror get <bucket/key>... [--refresh always|never|auto]
    s3mirror cat-json <bucket/key> [--refresh always|never|auto]
    s3mirror put <local_file> <bucket/key>
    s3mirror ls <bucket[/prefix]> [-r]
    s3mirror exists <bucket/key>
    s3mirror mb <bucket>
    s3mirror kv-get <bucket[/namespace]> <key>
    s3mirror kv-put <bucket[/namespace]> <key> <json_value> [--strict]
    s3mirror help

COMMANDS:
    get       Fetch objects into the local mirror and print their local paths
    cat-json  Load a .json or .pkl object and print it as JSON
    put       Upload a local file
    ls        List objects (directories are skipped)
    exists    Print whether an object exists
    mb        Create a bucket if it does not exist
    kv-get    Print the value stored under a string key
    kv-put    Store a JSON value under a string key
    help      Show this help message

ENVIRONMENT:
    S3MIRROR_ENDPOINT              host:port or URL (default 127.0.0.1:9000)
    S3MIRROR_ACCESS_KEY            Access key
    S3MIRROR_SECRET_KEY            Secret key
    S3MIRROR_CACHE_DIR             Local mirror root
    S3MIRROR_SECURE                Use https when the endpoint has no scheme
    S3MIRROR_REGION                Signing region (default us-east-1)
    S3MIRROR_DISABLE_AUTO_REFRESH  Run without the mtime store
    S3MIRROR_WORKERS               Batch worker count
    RUST_LOG                       Log filter, e.g. debug or s3mirror=trace,warn
"#
    );
}

/// Split arguments into positionals and recognised flags
struct Args {
    positional: Vec<String>,
    refresh: Option<Refresh>,
    recursive: bool,
    strict: bool,
}

fn split_args(raw: &[String]) -> Result<Args> {
    let mut args = Args {
        positional: Vec::new(),
        refresh: None,
        recursive: false,
        strict: false,
    };

    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--refresh" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--refresh needs a value"))?;
                args.refresh = Some(value.parse()?);
            }
            "-r" | "--recursive" => args.recursive = true,
            "--strict" => args.strict = true,
            _ => args.positional.push(arg.clone()),
        }
    }
    Ok(args)
}

fn parse_args() -> Result<Command> {
    let argv: Vec<String> = env::args().collect();

    if argv.len() < 2 {
        return Ok(Command::Help);
    }

    let args = split_args(&argv[2..])?;
    let p = &args.positional;
    let need = |n: usize, usage: &str| -> Result<()> {
        if p.len() < n {
            bail!("Usage: s3mirror {}", usage);
        }
        Ok(())
    };

    match argv[1].as_str() {
        "get" => {
            need(1, "get <bucket/key>... [--refresh always|never|auto]")?;
            Ok(Command::Get {
                paths: p.clone(),
                refresh: args.refresh,
            })
        }
        "cat-json" => {
            need(1, "cat-json <bucket/key> [--refresh always|never|auto]")?;
            Ok(Command::CatJson {
                path: p[0].clone(),
                refresh: args.refresh,
            })
        }
        "put" => {
            need(2, "put <local_file> <bucket/key>")?;
            Ok(Command::Put {
                local: PathBuf::from(&p[0]),
                remote: p[1].clone(),
            })
        }
        "ls" => {
            need(1, "ls <bucket[/prefix]> [-r]")?;
            Ok(Command::Ls {
                prefix: p[0].clone(),
                recursive: args.recursive,
            })
        }
        "exists" => {
            need(1, "exists <bucket/key>")?;
            Ok(Command::Exists { path: p[0].clone() })
        }
        "mb" => {
            need(1, "mb <bucket>")?;
            Ok(Command::Mb {
                bucket: p[0].clone(),
            })
        }
        "kv-get" => {
            need(2, "kv-get <bucket[/namespace]> <key>")?;
            Ok(Command::KvGet {
                namespace: p[0].clone(),
                key: p[1].clone(),
            })
        }
        "kv-put" => {
            need(3, "kv-put <bucket[/namespace]> <key> <json_value> [--strict]")?;
            Ok(Command::KvPut {
                namespace: p[0].clone(),
                key: p[1].clone(),
                value: p[2].clone(),
                strict: args.strict,
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", argv[1]);
            Ok(Command::Help)
        }
    }
}

async fn run(engine: &CacheEngine, command: Command) -> Result<()> {
    match command {
        Command::Get { paths, refresh } => {
            let refresh = refresh.unwrap_or_else(|| engine.default_refresh());
            if let [path] = paths.as_slice() {
                let local = engine
                    .fetch(path, refresh)
                    .await
                    .with_context(|| format!("failed to fetch {}", path))?;
                println!("{}", local.display());
                return Ok(());
            }

            let results = BatchCoordinator::from_engine(engine)
                .fetch_many(&paths, refresh, None)
                .await?;
            let mut failed = 0;
            for (path, result) in paths.iter().zip(results) {
                match result {
                    Ok(local) => println!("{}", local.display()),
                    Err(e) => {
                        failed += 1;
                        error!(path = %path, error = %e, "Fetch failed");
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} fetches failed", failed, paths.len());
            }
        }
        Command::CatJson { path, refresh } => {
            let refresh = refresh.unwrap_or_else(|| engine.default_refresh());
            let value: serde_json::Value = engine
                .load(&path, refresh, None)
                .await
                .with_context(|| format!("failed to load {}", path))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Put { local, remote } => {
            engine
                .upload_file(&local, &remote)
                .await
                .with_context(|| format!("failed to upload {}", local.display()))?;
            info!(remote = %remote, "Upload complete");
        }
        Command::Ls { prefix, recursive } => {
            for path in engine.list(&prefix, recursive).await? {
                println!("{}", path);
            }
        }
        Command::Exists { path } => {
            println!("{}", engine.object_exists(&path).await?);
        }
        Command::Mb { bucket } => {
            engine.make_bucket(&bucket, true).await?;
            info!(bucket = %bucket, "Bucket ready");
        }
        Command::KvGet { namespace, key } => {
            let kv = ContentAddressedStore::new(engine, &namespace, false)?;
            match kv.get::<_, serde_json::Value>(key.as_str()).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("no value stored under '{}'", key),
            }
        }
        Command::KvPut {
            namespace,
            key,
            value,
            strict,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value must be valid JSON")?;
            let kv = ContentAddressedStore::new(engine, &namespace, strict)?;
            let path = kv.path_for(key.as_str())?;
            kv.put(key.as_str(), &value).await?;
            println!("{}", path);
        }
        Command::Help => print_help(),
    }
    Ok(())
}

/// Log filter from `RUST_LOG` directives (`debug`, `s3mirror=trace,warn`),
/// falling back to `info` when unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = MirrorConfig::from_env().context("invalid configuration")?;
    let engine = CacheEngine::connect(config).context("failed to start cache engine")?;

    let outcome = run(&engine, command).await;
    if let Err(e) = engine.shutdown() {
        error!(error = %e, "Failed to close metadata store");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_module_directives() {
        let filter = log_filter(Some("s3mirror::cache=debug,warn"));
        let rendered = filter.to_string();
        assert!(rendered.contains("s3mirror::cache=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).to_string(), "info");
        let fallback = log_filter(Some("s3mirror=loud")).to_string();
        assert_eq!(fallback, "info");
    }

    #[test]
    fn test_split_args_flags() {
        let raw: Vec<String> = ["data/a", "--refresh", "never", "-r", "data/b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let args = split_args(&raw).unwrap();
        assert_eq!(args.positional, vec!["data/a", "data/b"]);
        assert_eq!(args.refresh, Some(Refresh::Never));
        assert!(args.recursive);
        assert!(!args.strict);
    }
}
