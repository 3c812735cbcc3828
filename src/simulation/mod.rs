mod builder;
mod comms;
mod scheduler;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

pub use builder::CommandLineOptions;
pub use builder::SimulationBuilder;
pub use comms::Comms;
pub use scheduler::StepScheduler;

use log::info;

use crate::communication::WorldCommunicator;
use crate::component::slice_for_rank;
use crate::component::Component;
use crate::config::ComponentConfig;
use crate::config::ForceId;
use crate::config::RunParameters;
use crate::config::SimulationConfig;
use crate::cylindrical::CylindricalBasis;
use crate::error::Error;
use crate::force::Force;
use crate::io;
use crate::io::FloatKind;
use crate::particle::BodyRecord;
use crate::particle::Particle;
use crate::spherical::SphericalBasis;

/// Fraction of the local dynamical time targeted by the level criterion.
const DYN_FRACTION: f64 = 0.1;

/// Global counters and knobs shared by everything in one run. Passed by
/// reference wherever the step position matters.
#[derive(Clone, Copy, Debug)]
pub struct SimulationContext {
    pub tnow: f64,
    pub dtime: f64,
    /// Outer step counter.
    pub step: u64,
    /// Global sub-step counter driving the coefficient windows.
    pub substep: u64,
    pub multistep: usize,
    pub nthreads: usize,
}

pub struct Simulation {
    pub context: SimulationContext,
    pub components: Vec<Component>,
    pub comms: Comms,
    run: RunParameters,
    scheduler: StepScheduler,
}

impl Simulation {
    /// Build components and their force methods from the configuration.
    /// Collective over all ranks.
    pub fn new(config: &SimulationConfig, mut comms: Comms) -> Result<Self, Error> {
        let multistep = config.run.multistep;
        let num_ranks = comms.size().0;
        let rank = comms.rank().0 as usize;

        let mut components = vec![];
        for entry in &config.components {
            let force = build_force(entry, config, multistep, &mut comms)?;
            let mut component = Component::new(
                entry.name.clone(),
                entry.params.clone(),
                force,
                multistep,
                num_ranks,
            );
            if let Some(bodyfile) = &entry.bodyfile {
                let particles = load_bodies(Path::new(bodyfile), &entry.name)?;
                component.nbodies_total = particles.len() as u64;
                component.setup_distribution(&config.run.rates, num_ranks);
                component.adopt_particles(slice_for_rank(
                    particles,
                    &component.nbodies_index,
                    rank,
                ));
                component.initialize_com_system(&mut comms.world);
                info!(
                    "component {}: {} bodies, {} local on rank {}",
                    component.name,
                    component.nbodies_total,
                    component.num_local(),
                    rank
                );
            }
            components.push(component);
        }

        Ok(Self {
            context: SimulationContext {
                tnow: 0.0,
                dtime: config.run.dtime,
                step: 0,
                substep: 0,
                multistep,
                nthreads: config.run.nthreads.max(1),
            },
            components,
            comms,
            run: config.run.clone(),
            scheduler: StepScheduler::new(multistep),
        })
    }

    /// One outer step: the full ladder of sub-steps, then the per-step
    /// bookkeeping (centers, level report, rebalancing).
    pub fn step(&mut self) {
        let nsub = self.scheduler.substeps_per_step();
        for s_local in 0..nsub {
            let m_lev = self.scheduler.first_active_level(s_local);
            self.substep(m_lev);
        }

        for component in self.components.iter_mut() {
            component.fix_positions(0, &mut self.comms.world);
        }
        if self.comms.is_main() {
            for component in &self.components {
                let path = PathBuf::from(format!("{}.comlog", component.name));
                if let Err(err) = component.write_com_log(self.context.tnow, &path) {
                    log::warn!("could not append center log for {}: {err}", component.name);
                }
                let nlevel = component.params.nlevel;
                if nlevel > 0 && self.context.step % nlevel as u64 == 0 {
                    component.print_level_lists(self.context.tnow);
                }
            }
        }

        self.context.step += 1;
        if self.run.nbalance > 0 && self.context.step % self.run.nbalance as u64 == 0 {
            self.load_balance();
        }
    }

    fn substep(&mut self, m_lev: usize) {
        let s = self.context.substep;
        let nthreads = self.context.nthreads;
        let step = self.context.step;

        for component in self.components.iter_mut() {
            component.force.tick(s);
            component.accumulate(m_lev, nthreads);
            component.reduce(m_lev, &mut self.comms.world, &mut self.comms.counts);
            component.force.compute_multistep_coefficients(s, m_lev);
            // The covariance only spans the whole population on the
            // sub-steps where every level synchronized.
            if m_lev == 0 && component.force.smoothing_due(step) {
                component.force.smooth();
            }
            component.apply_forces(m_lev);
            component.integrate(m_lev, self.context.dtime);
        }

        if self.context.multistep > 0 {
            self.reassign_levels(m_lev);
        }

        self.context.substep += 1;
        self.context.tnow +=
            self.context.dtime / self.scheduler.substeps_per_step() as f64;
    }

    /// Re-derive levels for the particles just advanced and queue the
    /// coefficient differentials; the queues drain at the barrier.
    fn reassign_levels(&mut self, m_lev: usize) {
        let dtime = self.context.dtime;
        let multistep = self.context.multistep;
        for component in self.components.iter_mut() {
            let mut changes = vec![];
            for level in m_lev..=multistep {
                for index in component.levlist(level) {
                    let p = component.particle(*index).unwrap();
                    let desired = desired_level(p, dtime, multistep);
                    if desired != level {
                        changes.push((*index, desired));
                    }
                }
            }
            for (index, to) in changes {
                component.change_level(index, to);
            }
            component
                .force
                .multistep_update_finish(&mut self.comms.world);
        }
    }

    pub fn run(&mut self) {
        for _ in 0..self.run.nsteps {
            self.step();
        }
        for component in self.components.iter_mut() {
            component.force.finalize();
        }
        info!(
            "run complete: {} steps to t = {:.6}",
            self.context.step, self.context.tnow
        );
    }

    pub fn load_balance(&mut self) {
        let rates = self.run.rates.clone();
        for component in self.components.iter_mut() {
            component.load_balance(
                &rates,
                &mut self.comms.bodies,
                &mut self.comms.world,
                &mut self.comms.control,
            );
        }
    }

    /// Gather every component onto rank 0 and write one PSP dump.
    pub fn write_checkpoint(&mut self, path: &Path) -> Result<(), Error> {
        let rank = self.comms.rank().0;
        let size = self.comms.size().0;

        let mut stanzas = vec![];
        for component in &self.components {
            let mut all: Vec<Particle> = component.particles().cloned().collect();
            if rank != 0 {
                let records: Vec<BodyRecord> =
                    all.iter().map(BodyRecord::pack).collect();
                let mut iattrs: Vec<i64> = vec![];
                let mut dattrs: Vec<f64> = vec![];
                for p in &all {
                    iattrs.extend(p.iattr.iter().map(|a| *a as i64));
                    dattrs.extend(&p.dattr);
                }
                self.comms.bodies.communicator.send_vec(0, records);
                self.comms.control.send_vec(0, iattrs);
                self.comms.world.send_vec(0, dattrs);
                continue;
            }
            for peer in 1..size as i32 {
                let records = self.comms.bodies.communicator.receive_vec(peer);
                let iattrs = self.comms.control.receive_vec(peer);
                let dattrs = self.comms.world.receive_vec(peer);
                let niattr = iattrs.len() / records.len().max(1);
                let ndattr = dattrs.len() / records.len().max(1);
                for (n, record) in records.iter().enumerate() {
                    let iattr = iattrs[n * niattr..(n + 1) * niattr]
                        .iter()
                        .map(|a| *a as i32)
                        .collect();
                    let dattr = dattrs[n * ndattr..(n + 1) * ndattr].to_vec();
                    all.push(record.unpack(iattr, dattr));
                }
            }
            all.sort_by_key(|p| p.index);
            let niattr = all.first().map(|p| p.iattr.len()).unwrap_or(0) as u32;
            let ndattr = all.first().map(|p| p.dattr.len()).unwrap_or(0) as u32;
            stanzas.push(io::ComponentStanza {
                name: component.name.clone(),
                parameters: serde_yaml::to_value(&component.params)
                    .unwrap_or(serde_yaml::Value::Null),
                bodyfile: String::new(),
                force_id: match &component.force {
                    Force::Spherical(_) => ForceId::SphereSL.name().to_owned(),
                    Force::Cylindrical(_) => ForceId::Cylinder.name().to_owned(),
                },
                force_parameters: serde_yaml::Value::Null,
                indexing: component.params.indexing,
                niattr,
                ndattr,
                particles: all,
            });
        }
        if rank == 0 {
            let mut out = std::io::BufWriter::new(File::create(path)?);
            io::write_dump(&mut out, self.context.tnow, &stanzas, FloatKind::F8)?;
        }
        Ok(())
    }
}

/// Desired timestep level from local dynamical criteria: the velocity,
/// acceleration and crossing timescales, each taken at a fixed fraction.
pub fn desired_level(p: &Particle, dtime: f64, multistep: usize) -> usize {
    let v = (p.vel[0] * p.vel[0] + p.vel[1] * p.vel[1] + p.vel[2] * p.vel[2]).sqrt();
    let a = (p.acc[0] * p.acc[0] + p.acc[1] * p.acc[1] + p.acc[2] * p.acc[2]).sqrt();
    let r = (p.pos[0] * p.pos[0] + p.pos[1] * p.pos[1] + p.pos[2] * p.pos[2]).sqrt();
    let mut dt = f64::INFINITY;
    if a > 0.0 {
        dt = dt.min(v / a);
        dt = dt.min((r / a).sqrt());
    }
    if v > 0.0 {
        dt = dt.min(r / v);
    }
    if !dt.is_finite() {
        return 0;
    }
    let dt = DYN_FRACTION * dt;
    if dt >= dtime {
        return 0;
    }
    let level = (dtime / dt).log2().ceil() as usize;
    level.min(multistep)
}

fn build_force(
    entry: &ComponentConfig,
    config: &SimulationConfig,
    multistep: usize,
    comms: &mut Comms,
) -> Result<Force, Error> {
    match entry.force.id {
        ForceId::SphereSL => Ok(Force::Spherical(SphericalBasis::new(
            entry.force.params.spherical(multistep),
        )?)),
        ForceId::Cylinder => {
            let params = entry.force.params.cylindrical(multistep, config.strict);
            let basis =
                CylindricalBasis::create(params, 0.0, &mut comms.world, &mut comms.control)?;
            Ok(Force::Cylindrical(Box::new(basis)))
        }
    }
}

/// Read a body file: PSP dumps are recognized by their marker, anything
/// else is parsed as an ASCII table.
fn load_bodies(path: &Path, component: &str) -> Result<Vec<Particle>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut probe = [0u8; 8];
    use std::io::Read;
    use std::io::Seek;
    let got = reader.read(&mut probe)?;
    reader.rewind()?;
    let looks_binary =
        got == 8 && u64::from_le_bytes(probe) & 0xffff_ffff_0000_0000 == 0xadbf_abc0_0000_0000;
    if looks_binary {
        let (_, stanzas) = io::read_dump(&mut reader)?;
        let stanza = stanzas
            .into_iter()
            .find(|s| s.name == component || s.name.is_empty())
            .ok_or_else(|| {
                crate::error::ConfigError::UnknownComponent(format!(
                    "{component} (not present in {path:?})"
                ))
            })
            .map_err(Error::Config)?;
        Ok(stanza.particles)
    } else {
        Ok(io::read_ascii_bodies(&mut reader)?)
    }
}

#[cfg(all(test, feature = "local"))]
mod tests;
