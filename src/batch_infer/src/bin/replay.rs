use batch_infer::{
    synthetic::{identity_module, parse_batch_counts, synthetic_group},
    Replayer, Summary,
};
use clap::{App, Arg, ArgMatches};
use memory_manager::MemoryManager;
use orchestrator::{Builder, Error, ModelConfig};
use std::path::Path;

fn value<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Error> {
    matches
        .value_of(name)
        .ok_or_else(|| Error::InvalidArg(format!("missing argument '{}'", name)))
}

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T, Error> {
    let s = value(matches, name)?;
    s.parse()
        .map_err(|_| Error::InvalidArg(format!("can't parse {} '{}'", name, s)))
}

fn run(matches: &ArgMatches) -> Result<Summary, Error> {
    let repository = Path::new(value(matches, "repository")?);
    let config = ModelConfig::from_file(repository.join("config.json"))?;
    let version: u64 = parse(matches, "version")?;
    let groups: usize = parse(matches, "groups")?;
    let cache_mib: usize = parse(matches, "cache_limit")?;
    let counts = parse_batch_counts(value(matches, "batch_counts")?)?;
    let identity = matches.is_present("identity");

    let memory_manager = MemoryManager::new().cache_limit(cache_mib << 20);
    let mut instances = vec![];
    for (i, device) in config.instance_devices().into_iter().enumerate() {
        let builder = Builder::new(config.clone())
            .device(device)
            .memory_manager(memory_manager.clone())
            .instance_index(i);
        let instance = if identity {
            builder.build(identity_module())?
        } else {
            builder.load(repository, version)?
        };
        instances.push(instance);
    }

    let mut replayer = Replayer::new(instances);
    for group in 0..groups {
        replayer.submit(synthetic_group(&config, &counts, group)?)?;
    }
    Ok(replayer.finish())
}

fn main() {
    let matches = App::new("Batch Infer Replay")
        .about("Replays synthetic request groups through the instances of one model")
        .arg(
            Arg::with_name("repository")
                .short("r")
                .help("Model directory holding config.json and numbered version directories")
                .default_value("demos")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("version")
                .short("v")
                .help("Model version to load")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("batch_counts")
                .short("b")
                .help("Batch count of every request in a group, e.g. 2,1,3")
                .default_value("2,1,3")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("groups")
                .short("g")
                .help("How many groups to replay")
                .default_value("16")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cache_limit")
                .short("l")
                .help("Bytes in MiB the memory manager keeps cached for reuse")
                .default_value("256")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("identity")
                .short("i")
                .help("Echo inputs instead of loading the model library"),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();
    match run(&matches) {
        Ok(summary) => {
            for error in &summary.errors {
                log::warn!("{}", error);
            }
            println!("{}", summary);
        }
        Err(err) => {
            log::error!("{}: {}", err.code(), err);
            std::process::exit(1);
        }
    }
}
