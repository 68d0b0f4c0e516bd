//! cartc - cartridge compiler command line
//!
//! Subcommands:
//! - `pack`: build an iNES image from a raw PRG bank and an optional
//!   startup routine
//! - `info`: print the header and vectors of an image
//! - `demo`: compile a built-in sample program to an image

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use cartc::ast::{self, Node};
use cartc::codegen::Segment;
use cartc::rom::{self, Header, Mirroring, PrgSize, Rom};
use cartc::types::Type;
use cartc::{Session, Target};

#[derive(Parser)]
#[command(name = "cartc", version, about = "6502 cartridge compiler")]
struct Cli {
    /// Log pipeline details (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a raw PRG bank and an optional startup routine
    Pack {
        /// Raw PRG bank, exactly 16 or 32 KiB including vectors
        input: PathBuf,
        /// Position-independent routine to run before the reset handler
        #[arg(long)]
        startup: Option<PathBuf>,
        #[arg(short, long, default_value = "out.nes")]
        output: PathBuf,
        /// PRG size in KiB
        #[arg(long, default_value = "32", value_parser = parse_prg)]
        prg: PrgSize,
        /// Vertical nametable mirroring
        #[arg(long)]
        vertical: bool,
    },
    /// Show the header and vectors of an image
    Info { rom: PathBuf },
    /// Compile the built-in sample program
    Demo {
        #[arg(short, long, default_value = "demo.nes")]
        output: PathBuf,
        #[arg(long, default_value = "32", value_parser = parse_prg)]
        prg: PrgSize,
        /// Print the IR before assembling
        #[arg(long)]
        dump: bool,
    },
}

fn parse_prg(s: &str) -> Result<PrgSize, String> {
    match s {
        "16" => Ok(PrgSize::Nrom128),
        "32" => Ok(PrgSize::Nrom256),
        other => Err(format!("PRG size must be 16 or 32, got {}", other)),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    let mut logger = env_logger::Builder::from_env(env);
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    match cli.command {
        Command::Pack { input, startup, output, prg, vertical } => {
            let bank = fs::read(&input).with_context(|| format!("Reading {}", input.display()))?;
            let routine = match startup {
                Some(path) => Segment {
                    origin: 0,
                    bytes: fs::read(&path).with_context(|| format!("Reading {}", path.display()))?,
                    relocations: Vec::new(),
                },
                None => Segment::default(),
            };
            let mut header = Header::new(prg);
            if vertical {
                header.mirroring = Mirroring::Vertical;
            }
            let image = rom::assemble(header, bank, &routine)
                .with_context(|| format!("Packing {}", input.display()))?;
            write_rom(&image, &output)?;
        }

        Command::Info { rom } => {
            let bytes = fs::read(&rom).with_context(|| format!("Reading {}", rom.display()))?;
            let image = Rom::from_bytes(&bytes).with_context(|| format!("Parsing {}", rom.display()))?;
            print_info(&image);
        }

        Command::Demo { output, prg, dump } => {
            let mut program = demo_program();
            let target = Target { prg, ..Target::default() };
            let mut session = Session::new(target);
            let ir = session.compile(&mut program).context("Compiling demo program")?;
            if dump {
                print!("{}", ir.dump());
            }
            let image = cartc::assemble(&ir, &target).context("Assembling demo program")?;
            write_rom(&image, &output)?;
        }
    }

    Ok(())
}

/// Write the image in one call; nothing is written if serialization fails
fn write_rom(image: &Rom, output: &Path) -> anyhow::Result<()> {
    let bytes = image.to_bytes();
    fs::write(output, &bytes).with_context(|| format!("Writing {}", output.display()))?;
    info!("wrote {} ({} bytes)", output.display(), bytes.len());
    println!("{} ({} bytes, reset ${:04X})", output.display(), bytes.len(), image.vectors().reset);
    Ok(())
}

fn print_info(image: &Rom) {
    let header = &image.header;
    let vectors = image.vectors();
    println!("PRG ROM:    {} x 16 KiB", header.prg_banks);
    println!("CHR ROM:    {} x 8 KiB", header.chr_banks);
    println!("Mapper:     {}", header.mapper);
    println!("Mirroring:  {:?}", header.mirroring);
    println!("Battery:    {}", header.battery);
    println!("NMI:        ${:04X}", vectors.nmi);
    println!("RESET:      ${:04X}", vectors.reset);
    println!("IRQ:        ${:04X}", vectors.irq);
}

/// Sample exercising every declaration form
fn demo_program() -> ast::Program {
    ast::Program {
        decls: vec![
            Node::var("lives", Type::UInt8, Some(Node::literal(3)))
                .with_attribute(Node::attribute("zeropage", vec![])),
            Node::var("score", Type::UInt16, Some(Node::ident("lives"))),
            Node::var(
                "palette",
                Type::array(Type::UInt8, 4),
                Some(Node::array(vec![
                    Node::literal(0x0F),
                    Node::literal(0x16),
                    Node::literal(0x27),
                    Node::literal(0x30),
                ])),
            ),
            Node::var("palette_ptr", Type::None, Some(Node::address_of("palette"))),
            Node::var("ppu_mask", Type::UInt8, Some(Node::literal(0x1E)))
                .with_attribute(Node::attribute("address", vec![("at", Node::literal(0x2001))])),
            Node::var("boot_flag", Type::UInt8, Some(Node::literal(1)))
                .with_attribute(Node::attribute("startup", vec![])),
        ],
    }
}
