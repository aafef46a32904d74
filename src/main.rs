//! Command-line entry point for the enrichment pipeline.
//!
//! Thin invocation surface: parse arguments, load config and the site
//! table, wire the HTTP clients, run the pipeline, report the outcome.

use std::path::PathBuf;
use std::process::ExitCode;

use sitecat_service::compose::DeriveRule;
use sitecat_service::config::ServiceConfig;
use sitecat_service::ingest::streamcat::StreamCatClient;
use sitecat_service::ingest::waters::WatersClient;
use sitecat_service::ingest;
use sitecat_service::logging::{self, DataSource, LogLevel};
use sitecat_service::model::{Aoi, CancelFlag};
use sitecat_service::pipeline::{Pipeline, PipelineRequest, PipelineServices, Stage};
use sitecat_service::sites::load_sites;

const USAGE: &str = "\
Usage: sitecat_service --sites <sites.csv> --variables <name,name,...> [options]

Required:
  --sites <path>        Input CSV with site_id,longitude,latitude headers
  --variables <list>    Comma-separated metric short names

Options:
  --aoi <scope>         'catchment' or 'watershed' (default: watershed)
  --config <path>       TOML config file (default: ./sitecat.toml)
  --output <path>       Enriched output CSV (default: <checkpoint_dir>/enriched.csv)
  --derive NAME=A+B+C   Add a derived column summing existing columns
                        (repeatable)
  --force-resolve       Re-resolve sites already in the link store
  --log-file <path>     Append log lines to a file
  --verbose             Debug-level logging
  -h, --help            Show this help
";

#[derive(Debug)]
struct CliArgs {
    sites: PathBuf,
    variables: Vec<String>,
    aoi: Aoi,
    config: PathBuf,
    output: Option<PathBuf>,
    derives: Vec<DeriveRule>,
    force_resolve: bool,
    log_file: Option<String>,
    verbose: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut sites = None;
    let mut variables = Vec::new();
    let mut aoi = Aoi::Watershed;
    let mut config = PathBuf::from("./sitecat.toml");
    let mut output = None;
    let mut derives = Vec::new();
    let mut force_resolve = false;
    let mut log_file = None;
    let mut verbose = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value_for = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} requires a value", name))
        };
        match arg.as_str() {
            "--sites" => sites = Some(PathBuf::from(value_for("--sites")?)),
            "--variables" => {
                variables = value_for("--variables")?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "--aoi" => aoi = value_for("--aoi")?.parse()?,
            "--config" => config = PathBuf::from(value_for("--config")?),
            "--output" => output = Some(PathBuf::from(value_for("--output")?)),
            "--derive" => derives.push(parse_derive_rule(&value_for("--derive")?)?),
            "--force-resolve" => force_resolve = true,
            "--log-file" => log_file = Some(value_for("--log-file")?),
            "--verbose" => verbose = true,
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    let sites = sites.ok_or("--sites is required")?;
    if variables.is_empty() {
        return Err("--variables is required".to_string());
    }

    Ok(CliArgs {
        sites,
        variables,
        aoi,
        config,
        output,
        derives,
        force_resolve,
        log_file,
        verbose,
    })
}

/// Parses "NAME=A+B+C" into a sum rule over columns A, B, C.
fn parse_derive_rule(spec: &str) -> Result<DeriveRule, String> {
    let (name, inputs) = spec
        .split_once('=')
        .ok_or_else(|| format!("derive rule '{}' must look like NAME=A+B+C", spec))?;
    let name = name.trim();
    let inputs: Vec<String> = inputs
        .split('+')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if name.is_empty() || inputs.is_empty() {
        return Err(format!("derive rule '{}' must look like NAME=A+B+C", spec));
    }
    Ok(DeriveRule::sum(name, inputs))
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {}\n\n{}", msg, USAGE);
            return ExitCode::from(2);
        }
    };

    logging::init_logger(
        if args.verbose { LogLevel::Debug } else { LogLevel::Info },
        args.log_file.as_deref(),
    );

    let config = match ServiceConfig::load(&args.config) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {}", msg);
            return ExitCode::from(2);
        }
    };

    let sites = match load_sites(&args.sites) {
        Ok(sites) => sites,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(2);
        }
    };
    if sites.is_empty() {
        eprintln!("error: site table {} has no rows", args.sites.display());
        return ExitCode::from(2);
    }

    let client = match ingest::http_client(config.request_timeout_secs) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let waters = WatersClient::new(&config, &client);
    let streamcat = StreamCatClient::new(&config, &client);

    let pipeline = Pipeline::new(
        &config,
        PipelineServices {
            variables: &streamcat,
            comids: &waters,
            metrics: &streamcat,
        },
    );
    let request = PipelineRequest {
        sites,
        variables: args.variables,
        aoi: args.aoi,
        force_resolve: args.force_resolve,
        output_path: args.output,
    };

    match pipeline.run(&request, &args.derives, &CancelFlag::new()) {
        Ok(report) if report.stage == Stage::Failed => {
            eprintln!(
                "variable validation failed; not in the catalog: {}",
                report.invalid_variables.join(", ")
            );
            eprintln!("fix the variable list and re-run");
            ExitCode::FAILURE
        }
        Ok(report) => {
            println!(
                "enriched {} sites ({} already resolved, {} resolution errors, {} fetch errors)",
                report.enriched.len(),
                report.sites_skipped,
                report.resolution_errors.len(),
                report.fetch_errors.len(),
            );
            if let Some(path) = report.output_path {
                println!("output: {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            logging::error(DataSource::System, None, &err.to_string());
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
