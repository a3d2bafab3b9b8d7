use buildo::run;

#[derive(argh::FromArgs)]
/// incremental C build engine
struct Args {
    /// parallel build jobs [default=1]
    #[argh(option, short = 'j', default = "1")]
    jobs: usize,

    /// one job per available cpu
    #[argh(switch, short = 'm')]
    multitask: bool,

    /// print tool command lines as they run
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// compiler to use, persisted across invocations
    #[argh(option)]
    cc: Option<String>,

    /// path of the final archive [default=out/libspooky.a]
    #[argh(option, short = 'o', default = "String::from(\"out/libspooky.a\")")]
    output: String,

    /// targets; "print" lists stale vertices without building
    #[argh(positional)]
    targets: Vec<String>,
}

fn main() {
    let args: Args = argh::from_env();
    let parallelism = if args.multitask {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        args.jobs
    };
    let opts = run::Options {
        parallelism,
        verbose: args.verbose,
        cc: args.cc,
        output: args.output,
        targets: args.targets,
    };
    let exit_code = match run::run(opts) {
        Ok(code) => code,
        Err(err) => {
            println!("buildo: error: {}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
