//! The `calltrace` command line: instrument, shuffle or round-trip a PE
//! image, and dump trace files.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};

use common::Logger;
use rewriter::pe::writer::write_image;
use rewriter::pe::{ImageLayout, ParsedImage, PeParser, DIR_IMPORT};
use rewriter::pdb::PdbFile;
use rewriter::transforms::{
    InstrumentTransform, ShuffleTransform, Transform, TransformContext, DEFAULT_AGENT_DLL,
};
use trace::record::Record;
use trace::segment::TraceFileReader;

fn cli() -> Command {
    Command::new("calltrace")
        .about("Binary instrumentation and call tracing for 32-bit PE images")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity (-v, -vv, -vvv)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log errors only"),
        )
        .subcommand(
            Command::new("instrument")
                .about("Divert every call in IMAGE through the tracing agent")
                .arg(path_arg("input"))
                .arg(path_arg("output"))
                .arg(
                    Arg::new("agent-dll")
                        .long("agent-dll")
                        .value_name("NAME")
                        .default_value(DEFAULT_AGENT_DLL)
                        .help("Agent DLL to import the hooks from"),
                )
                .arg(
                    Arg::new("with-pdb")
                        .long("with-pdb")
                        .value_name("PDB")
                        .value_parser(value_parser!(PathBuf))
                        .help("Rewrite this PDB to match the output image"),
                ),
        )
        .subcommand(
            Command::new("shuffle")
                .about("Randomly relink the code sections of IMAGE")
                .arg(path_arg("input"))
                .arg(path_arg("output"))
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .required(true)
                        .value_parser(value_parser!(u64))
                        .help("RNG seed; equal seeds give equal layouts"),
                ),
        )
        .subcommand(
            Command::new("roundtrip")
                .about("Parse IMAGE and write it back unchanged")
                .arg(path_arg("input"))
                .arg(path_arg("output")),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the records of a trace file")
                .arg(path_arg("trace")),
        )
}

fn path_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .required(true)
        .value_parser(value_parser!(PathBuf))
}

fn parse_image(path: &PathBuf) -> Result<ParsedImage> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    PeParser::parse(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn emit_image(parsed: &ParsedImage, output: &PathBuf) -> Result<()> {
    let layout = ImageLayout::build(&parsed.graph, &parsed.header_info)?;
    let image = write_image(&parsed.graph, &layout)?;
    fs::write(output, &image).with_context(|| format!("writing {}", output.display()))?;
    info!("wrote {} ({} bytes)", output.display(), image.len());
    Ok(())
}

fn instrument(matches: &ArgMatches) -> Result<()> {
    let input: &PathBuf = matches.get_one("input").unwrap();
    let output: &PathBuf = matches.get_one("output").unwrap();
    let agent_dll: &String = matches.get_one("agent-dll").unwrap();

    let mut parsed = parse_image(input)?;
    let mut transform = InstrumentTransform::new(agent_dll.clone())
        .with_entry_point(parsed.header_info.entry_point)
        .with_import_directory(parsed.header_info.data_directories[DIR_IMPORT]);
    transform.transform(&mut parsed.graph, &TransformContext::default())?;
    info!(
        "instrumented: {} thunk(s), {} reference(s) redirected",
        transform.thunks_created, transform.references_redirected
    );
    if let Some(entry) = transform.thunked_entry_point {
        parsed.header_info.entry_point = Some(entry);
    }
    if let Some(directory) = transform.new_import_directory {
        parsed.header_info.data_directories[DIR_IMPORT] = Some(directory);
    }
    emit_image(&parsed, output)?;

    if let Some(pdb_path) = matches.get_one::<PathBuf>("with-pdb") {
        let id = parsed
            .debug_id
            .context("image carries no debug id to match a PDB against")?;
        let pdb_bytes =
            fs::read(pdb_path).with_context(|| format!("reading {}", pdb_path.display()))?;
        let mut pdb = PdbFile::parse(&pdb_bytes)?;
        pdb.set_debug_id(&id)?;
        let out_pdb = output.with_extension("pdb");
        fs::write(&out_pdb, pdb.write()?)
            .with_context(|| format!("writing {}", out_pdb.display()))?;
        info!("wrote {}", out_pdb.display());
    }
    Ok(())
}

fn shuffle(matches: &ArgMatches) -> Result<()> {
    let input: &PathBuf = matches.get_one("input").unwrap();
    let output: &PathBuf = matches.get_one("output").unwrap();
    let seed: u64 = *matches.get_one("seed").unwrap();

    let mut parsed = parse_image(input)?;
    ShuffleTransform::new(seed).transform(&mut parsed.graph, &TransformContext::default())?;
    emit_image(&parsed, output)
}

fn roundtrip(matches: &ArgMatches) -> Result<()> {
    let input: &PathBuf = matches.get_one("input").unwrap();
    let output: &PathBuf = matches.get_one("output").unwrap();
    let parsed = parse_image(input)?;
    emit_image(&parsed, output)
}

fn dump(matches: &ArgMatches) -> Result<()> {
    let path: &PathBuf = matches.get_one("trace").unwrap();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let reader = TraceFileReader::parse(&bytes)?;

    let header = &reader.header;
    println!(
        "process {} module {:#010x}+{:#x} ({})",
        header.process_id, header.module_base, header.module_size, header.module_path
    );
    println!(
        "clock: {} ticks/s, {} tsc/s",
        header.clock.tick_frequency, header.clock.tsc_frequency
    );
    for (segment, records) in reader.segments() {
        println!(
            "segment: thread {} ({} bytes)",
            segment.thread_id, segment.segment_length
        );
        for (prefix, payload) in records {
            match Record::decode(&prefix, payload) {
                Ok(record) => println!("  [{:>16}] {record:?}", prefix.timestamp),
                Err(err) => println!("  [{:>16}] <undecodable: {err:#}>", prefix.timestamp),
            }
        }
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("instrument", sub)) => instrument(sub),
        Some(("shuffle", sub)) => shuffle(sub),
        Some(("roundtrip", sub)) => roundtrip(sub),
        Some(("dump", sub)) => dump(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn main() {
    let matches = cli().get_matches();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    Logger::init_with_level(Logger::level_from_flags(quiet, verbose));

    if let Err(err) = run(&matches) {
        error!("{err:#}");
        process::exit(1);
    }
}
