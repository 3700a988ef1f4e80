use std::path::PathBuf;
use std::process::exit;
use argh::FromArgs;
use libdynpart_r::bootctrl::{get_current_android_slot, Slot};
use libdynpart_r::extent::bytes2ieee;
use libdynpart_r::{
    default_config_path, init_super_metadata, run_optimize, run_plan, show_slot, write_template_config,
};

#[derive(FromArgs)]
/// dynpart command line multi call tool,
/// plan the dynamic partitions of an A/B update in super
struct CmdProg {
    #[argh(subcommand)]
    /// subcommand
    mode: Mode,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Mode {
    Template(TemplateMode),
    Init(InitMode),
    Plan(PlanMode),
    Show(ShowMode),
    Optimize(OptimizeMode),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "template", example = "dynpart template -o device.toml")]
/// generate a template device config file
struct TemplateMode {
    /// output file
    #[argh(option, short = 'o')]
    output: String,
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "init",
    description = "Create the super metadata of both slots in the metadata_dir of the config. \
Use -m <manifest> to lay out the partitions of --slot as a factory image would.",
    example = "dynpart init -c device.toml --size 4294967296",
    example = "dynpart init -c device.toml --size 4294967296 -m factory.toml --slot 0"
)]
/// create initial super metadata
struct InitMode {
    /// device config
    #[argh(option, short = 'c')]
    config: Option<String>,
    /// super partition size in bytes
    #[argh(option)]
    size: u64,
    /// manifest holding the factory layout
    #[argh(option, short = 'm')]
    manifest: Option<String>,
    /// slot receiving the factory layout, default is the current slot
    #[argh(option)]
    slot: Option<u32>,
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "plan",
    description = "Prepare the target slot for an update manifest and print the committed table. \
Devices are never touched, mapping is simulated.",
    example = "dynpart plan -c device.toml -m update.toml",
    example = "dynpart plan -c device.toml -m update.toml --source 1 --target 0 --delete-source"
)]
/// prepare partitions for an update
struct PlanMode {
    /// device config
    #[argh(option, short = 'c')]
    config: Option<String>,
    /// update manifest
    #[argh(option, short = 'm')]
    manifest: String,
    /// source slot number, default is the current slot
    #[argh(option)]
    source: Option<u32>,
    /// target slot number, default is the other slot
    #[argh(option)]
    target: Option<u32>,
    /// resume an interrupted update without touching metadata
    #[argh(switch)]
    resume: bool,
    /// delete source partitions to make room (recovery only)
    #[argh(switch)]
    delete_source: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "show", example = "dynpart show -c device.toml --slot 1")]
/// show the super metadata of a slot
struct ShowMode {
    /// device config
    #[argh(option, short = 'c')]
    config: Option<String>,
    /// slot number, default is the current slot
    #[argh(option)]
    slot: Option<u32>,
    /// only print space usage
    #[argh(switch, short = 'n')]
    summary: bool,
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "optimize",
    example = "dynpart optimize -c device.toml -m update.toml -o op.toml -p system"
)]
/// drop self copies from a SOURCE_COPY operation
struct OptimizeMode {
    /// device config
    #[argh(option, short = 'c')]
    config: Option<String>,
    /// update manifest
    #[argh(option, short = 'm')]
    manifest: String,
    /// operation file
    #[argh(option, short = 'o')]
    operation: String,
    /// partition the operation writes, without slot suffix
    #[argh(option, short = 'p')]
    partition: String,
    /// source slot number, default is the current slot
    #[argh(option)]
    source: Option<u32>,
}

fn config_path(config: Option<String>) -> PathBuf {
    config.map(PathBuf::from).unwrap_or_else(default_config_path)
}

fn checked_slot(number: u32) -> Slot {
    Slot::new(number).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        exit(1);
    })
}

fn slot_or_current(slot: Option<u32>) -> Slot {
    if let Some(number) = slot {
        return checked_slot(number);
    }
    get_current_android_slot().unwrap_or_else(|| {
        eprintln!("Error: cannot determine current slot, pass it explicitly");
        exit(1);
    })
}

fn main() {
    let args: CmdProg = argh::from_env();
    let result = match args.mode {
        Mode::Template(template) => write_template_config(&PathBuf::from(&template.output))
            .map(|_| println!("Template written to {}", template.output)),
        Mode::Init(init) => {
            let slot = slot_or_current(init.slot);
            let manifest = init.manifest.map(PathBuf::from);
            init_super_metadata(&config_path(init.config), init.size, slot, manifest.as_deref())
                .map(|table| println!("{}", table))
        }
        Mode::Plan(plan) => {
            let source = slot_or_current(plan.source);
            let target = plan.target.map(checked_slot).unwrap_or_else(|| source.other());
            run_plan(
                &config_path(plan.config),
                &PathBuf::from(plan.manifest),
                source,
                target,
                plan.resume,
                plan.delete_source,
            )
            .map(|(strategy, table)| {
                println!("Strategy : {:?}", strategy);
                match table {
                    Some(table) => println!("{}", table),
                    None => println!("No metadata stored for slot {}", target),
                }
            })
        }
        Mode::Show(show) => {
            let slot = slot_or_current(show.slot);
            show_slot(&config_path(show.config), slot).map(|table| {
                if show.summary {
                    println!("Slot {} : {} used of {}", slot,
                             bytes2ieee(table.used_space()), bytes2ieee(table.allocatable_space()));
                } else {
                    println!("{}", table);
                }
            })
        }
        Mode::Optimize(optimize) => {
            let source = slot_or_current(optimize.source);
            run_optimize(
                &config_path(optimize.config),
                &PathBuf::from(optimize.manifest),
                &PathBuf::from(optimize.operation),
                &optimize.partition,
                source,
            )
            .map(|op| {
                if op.is_noop() {
                    println!("Operation is a no-op, skip it");
                    return;
                }
                match toml::to_string(&op) {
                    Ok(out) => println!("{}", out),
                    Err(e) => eprintln!("Error: cannot print operation: {}", e),
                }
            })
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}
