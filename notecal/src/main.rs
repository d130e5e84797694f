use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime, Weekday};
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use notecal::duplicate::{CollisionInfo, DuplicateRequest, DuplicateStore};
use notecal::filter::{AgendaCustomList, FilterEngine};
use notecal::formula::{DateFormulaParser, supported_keywords};
use notecal::logging::default_logger;
use notecal::model::{CalendarConfig, DataFrame, ProcessedCalendarData, date_key, parse_date_key};
use notecal::processor::CalendarDataProcessor;

#[derive(Debug, Parser)]
#[command(
    name = "notecal",
    about = "Calendar and agenda views over note frontmatter",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process a data frame into a day-by-day calendar.
    Calendar(CalendarArgs),

    /// Run a custom agenda list against a data frame.
    Agenda(AgendaArgs),

    /// Resolve a relative date formula such as `today+1w`.
    Formula(FormulaArgs),

    /// Preview duplicating an event onto other dates and report collisions.
    Duplicate(DuplicateArgs),
}

#[derive(Debug, Args)]
struct CalendarArgs {
    /// Data frame JSON (`{"fields": [...], "records": [...]}`).
    #[arg(long)]
    input: PathBuf,
    /// Calendar configuration JSON; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Data frame JSON.
    #[arg(long)]
    input: PathBuf,
    /// Custom list definition JSON.
    #[arg(long)]
    list: PathBuf,
    /// Date that relative formulas resolve against. Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// First day of the week for `sow`/`eow` (e.g. `sun`, `mon`).
    #[arg(long, default_value = "sun")]
    week_start: Weekday,
    /// Emit JSON instead of one record id per line.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormulaArgs {
    /// Formula to resolve; omit with `--list-keywords`.
    formula: Option<String>,
    /// Base date. Defaults to today.
    #[arg(long)]
    base: Option<NaiveDate>,
    #[arg(long, default_value = "sun")]
    week_start: Weekday,
    /// Print the accepted anchor keywords and exit.
    #[arg(long)]
    list_keywords: bool,
}

#[derive(Debug, Args)]
struct DuplicateArgs {
    /// Data frame JSON.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Id of the record to duplicate.
    #[arg(long)]
    source: String,
    /// Target dates; for multi-day events each date starts a new span.
    #[arg(long = "date", required = true)]
    dates: Vec<NaiveDate>,
    /// Override the start time of every duplicate (HH:MM).
    #[arg(long)]
    start_time: Option<NaiveTime>,
    /// Override the end time of every duplicate (HH:MM).
    #[arg(long)]
    end_time: Option<NaiveTime>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;
    match cli.command {
        Commands::Calendar(args) => handle_calendar(args),
        Commands::Agenda(args) => handle_agenda(args),
        Commands::Formula(args) => handle_formula(args),
        Commands::Duplicate(args) => handle_duplicate(args),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    Logger::try_with_str(level)
        .with_context(|| format!("invalid log level `{level}`"))?
        .log_to_stderr()
        .start()
        .context("starting logger")
}

fn load_frame(path: &Path) -> Result<DataFrame> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing data frame {:?}", path))
}

fn load_config(path: Option<&Path>) -> Result<CalendarConfig> {
    let Some(path) = path else {
        return Ok(CalendarConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing calendar config {:?}", path))
}

fn load_list(path: &Path) -> Result<AgendaCustomList> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing agenda list {:?}", path))
}

fn process(input: &Path, config: Option<&Path>) -> Result<(CalendarConfig, ProcessedCalendarData)> {
    let frame = load_frame(input)?;
    let config = load_config(config)?;
    let processor = CalendarDataProcessor::new(config.clone(), default_logger());
    log::debug!("processing {} records from {:?}", frame.records.len(), input);
    Ok((config, processor.process(&frame)))
}

fn handle_calendar(args: CalendarArgs) -> Result<()> {
    let CalendarArgs {
        input,
        config,
        from,
        to,
        json,
    } = args;
    let (config, mut data) = process(&input, config.as_deref())?;
    data.grouped.retain(|key, _| in_range(key, from, to));

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }
    if data.grouped.is_empty() {
        eprintln!("No events found for the provided inputs.");
        return Ok(());
    }
    for (day, events) in &data.grouped {
        println!("== {day} ==");
        for event in events {
            let when = match &event.time_info {
                Some(time) => format!(
                    "{}-{}",
                    config.format_time(time.start_time.time()),
                    config.format_time(time.end_time.time())
                ),
                None => "all day".to_string(),
            };
            println!("  {:<13} lane {:<2} {}", when, event.lane, event.id());
        }
    }
    Ok(())
}

fn in_range(key: &str, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    let Some(day) = parse_date_key(key) else {
        return false;
    };
    from.is_none_or(|from| day >= from) && to.is_none_or(|to| day <= to)
}

fn handle_agenda(args: AgendaArgs) -> Result<()> {
    let AgendaArgs {
        input,
        list,
        date,
        week_start,
        json,
    } = args;
    let frame = load_frame(&input)?;
    let list = load_list(&list)?;
    let base = date.unwrap_or_else(|| Local::now().date_naive());

    let engine = FilterEngine::new(default_logger()).with_week_start(week_start);
    let matched = engine.filter_records_for_list(&frame.records, &list, base);
    log::debug!(
        "list `{}` matched {} of {} records",
        list.name,
        matched.len(),
        frame.records.len()
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&matched)?);
    } else if matched.is_empty() {
        eprintln!("No records match list `{}`.", list.name);
    } else {
        for record in matched {
            println!("{}", record.id);
        }
    }
    Ok(())
}

fn handle_formula(args: FormulaArgs) -> Result<()> {
    let FormulaArgs {
        formula,
        base,
        week_start,
        list_keywords,
    } = args;
    if list_keywords {
        for keyword in supported_keywords() {
            println!("{keyword}");
        }
        return Ok(());
    }
    let Some(formula) = formula else {
        anyhow::bail!("a formula is required unless --list-keywords is given");
    };
    let base = base.unwrap_or_else(|| Local::now().date_naive());
    let resolved = DateFormulaParser::new(week_start)
        .parse(&formula, base)
        .with_context(|| format!("resolving `{formula}` against {base}"))?;
    println!("{}", date_key(resolved));
    Ok(())
}

fn handle_duplicate(args: DuplicateArgs) -> Result<()> {
    let DuplicateArgs {
        input,
        config,
        source,
        dates,
        start_time,
        end_time,
        json,
    } = args;
    let (_, data) = process(&input, config.as_deref())?;
    let record = data
        .index
        .get(&source)
        .cloned()
        .with_context(|| format!("no dated record with id `{source}`"))?;

    let mut store = DuplicateStore::new();
    let source_date = record.start_date;
    store.init(record, source_date, data);
    for date in dates {
        store.toggle_date(date)?;
    }
    if let Some(start) = start_time {
        store.set_start_time(start)?;
    }
    if let Some(end) = end_time {
        store.set_end_time(end)?;
    }

    let requests = store.pending_duplicates();
    let collisions = store.collisions().cloned().unwrap_or_default();
    if json {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonOutput<'a> {
            duplicates: &'a [DuplicateRequest],
            collisions: &'a BTreeMap<String, CollisionInfo>,
            has_critical_collisions: bool,
        }
        let payload = JsonOutput {
            duplicates: &requests,
            collisions: &collisions,
            has_critical_collisions: store.has_critical_collisions(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for request in &requests {
        let date = date_key(request.start_date);
        let status = match collisions.get(&date) {
            Some(collision) => format!(
                "{:?} overlap with {}",
                collision.overlap_type,
                collision
                    .overlapping_records
                    .iter()
                    .map(|r| r.id())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => "free".to_string(),
        };
        println!("{date} .. {}  {status}", date_key(request.end_date));
    }
    if store.has_critical_collisions() {
        log::warn!("some duplicates overlap existing timed events");
    }
    Ok(())
}
