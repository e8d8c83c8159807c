use clap::{Parser, Subcommand};
use plc_examer::{llm::AnalysisKind, Analyzer, Config, Reporter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plc-examer")]
#[command(about = "Dependency-aware sharding and LLM analysis of PLC XML programs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a PLC XML file with the reasoning service
    Analyze {
        /// PLC XML file to analyze
        file: PathBuf,

        /// Output directory for reports
        #[arg(short, long, default_value = "./analysis-output")]
        output: PathBuf,

        /// What to look for
        #[arg(short = 't', long = "type", value_enum, default_value_t = AnalysisKind::Alarm)]
        analysis_type: AnalysisKind,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Split a PLC XML file into shards without calling the service
    Shard {
        /// PLC XML file to shard
        file: PathBuf,

        /// Output directory for the shard files
        #[arg(short, long, default_value = "./shard-output")]
        output: PathBuf,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate a documented configuration file
    Config {
        /// Output path for the config file (defaults to ~/.plc-examer.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the configuration
    Check {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            file,
            output,
            analysis_type,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            analyze_file(config, &file, &output, analysis_type).await?;
        }
        Commands::Shard { file, output, config } => {
            let config = load_config(config.as_deref())?;
            shard_file(config, &file, &output)?;
        }
        Commands::Config { output } => {
            init_logging("info");
            generate_config(output)?;
        }
        Commands::Check { config } => {
            let config = load_config(config.as_deref())?;
            check_config(&config)?;
        }
    }

    Ok(())
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .without_time()
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    init_logging(&config.app.log_level);
    Ok(config)
}

async fn analyze_file(config: Config, file: &Path, output: &Path, kind: AnalysisKind) -> anyhow::Result<()> {
    println!("🚀 Starting PLC {} Analysis", kind);
    println!("==============================");

    let problems = config.validate(true);
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  ✗ {}", problem);
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    let start_time = Instant::now();
    println!("🎯 Input file: {}", file.display());
    println!("📤 Output directory: {}", output.display());

    let analyzer = Analyzer::new(config)?;

    println!("\n🔍 Extracting and sharding...");
    let plan = analyzer.plan_file(file)?;
    plan.print_summary();

    println!("\n🤖 Analyzing {} shards...", plan.shards.len());
    let run = analyzer.analyze_plan(plan, kind).await;
    println!();
    run.print_summary();

    println!("\n📊 Generating reports...");
    let reporter = Reporter::new();
    let mut exported_files = reporter.export_report(&run.report, output)?;
    exported_files.extend(reporter.export_shards(&run.plan, output)?);

    println!("\n✅ Analysis completed in {:.2}s", start_time.elapsed().as_secs_f64());
    println!("📁 Reports exported to:");
    for file in exported_files.iter().filter(|p| !p.starts_with(output.join("shards"))) {
        println!("   - {}", file.display());
    }
    println!("   - {} ({} shard files)", output.join("shards").display(), run.plan.shards.len());

    Ok(())
}

fn shard_file(config: Config, file: &Path, output: &Path) -> anyhow::Result<()> {
    println!("✂️  Sharding {}", file.display());

    let analyzer = Analyzer::new(config)?;
    let plan = analyzer.plan_file(file)?;
    plan.print_summary();

    let exported_files = Reporter::new().export_shards(&plan, output)?;
    println!("\n✅ Wrote {} files to {}", exported_files.len(), output.display());
    Ok(())
}

fn generate_config(output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = output_path.unwrap_or_else(|| {
        Config::default_config_path().unwrap_or_else(|_| PathBuf::from("plc-examer.toml"))
    });

    println!("📝 Generating configuration file: {}", config_path.display());
    std::fs::write(&config_path, Config::create_documented_config())?;

    println!("✅ Configuration file created successfully!");
    println!("💡 Set DEEPSEEK_API_KEY or edit llm.api_key before running an analysis.");
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    println!("🔧 Checking configuration");

    let problems = config.validate(true);
    if problems.is_empty() {
        println!("✅ Configuration is valid");
        println!("  Model: {} at {}", config.llm.model, config.llm.api_base);
        println!(
            "  Shard budget: {} tokens, {} concurrent requests",
            config.sharding.max_shard_tokens, config.dispatch.max_concurrent_requests
        );
        return Ok(());
    }

    for problem in &problems {
        eprintln!("  ✗ {}", problem);
    }
    anyhow::bail!("invalid configuration ({} problems)", problems.len())
}
