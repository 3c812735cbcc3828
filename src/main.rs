use bfexp::prelude::*;
use bfexp::simulation::CommandLineOptions;
use clap::Parser;

fn main() {
    let opts = CommandLineOptions::parse();
    let comms = make_comms();
    let mut builder = SimulationBuilder::new();
    builder.with_command_line_options(&opts);
    let mut sim = match builder.build(comms) {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(err.exit_code());
        }
    };
    sim.run();
    #[cfg(feature = "mpi")]
    bfexp::communication::MPI_UNIVERSE.drop();
}

#[cfg(feature = "mpi")]
fn make_comms() -> Comms {
    Comms::for_mpi()
}

#[cfg(not(feature = "mpi"))]
fn make_comms() -> Comms {
    // Without MPI the binary runs as a single rank over the local
    // channel world.
    Comms::local_set(1).remove(0)
}
