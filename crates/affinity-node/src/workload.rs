//! Seeded access workload with planted communities.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use affinity_graph::{AccessDetail, AffinityGroup, GraphBuilder, Identity, ObjectId};
use affinity_lpa::AffinityService;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid simulation setting: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Graph(#[from] affinity_graph::Error),

    #[error(transparent)]
    Affinity(#[from] affinity_lpa::Error),
}

/// Shape of the simulated cluster and its workload.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub nodes: usize,
    pub communities: usize,
    pub community_size: usize,
    pub objects_per_community: usize,
    pub rounds: u32,
    pub seed: u64,
    /// Chance that a member lives on its community's home node.
    pub locality: f64,
    /// Chance that an access strays into another community's objects.
    pub noise: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            communities: 6,
            community_size: 8,
            objects_per_community: 4,
            rounds: 3,
            seed: 42,
            locality: 0.8,
            noise: 0.05,
        }
    }
}

impl SimConfig {
    /// Read `AFFINITY_SIM_*` overrides from the environment.
    pub fn from_env() -> Result<Self, SimError> {
        let defaults = Self::default();
        let config = Self {
            nodes: setting("AFFINITY_SIM_NODES", defaults.nodes)?,
            communities: setting("AFFINITY_SIM_COMMUNITIES", defaults.communities)?,
            community_size: setting("AFFINITY_SIM_COMMUNITY_SIZE", defaults.community_size)?,
            objects_per_community: setting("AFFINITY_SIM_OBJECTS", defaults.objects_per_community)?,
            rounds: setting("AFFINITY_SIM_ROUNDS", defaults.rounds)?,
            seed: setting("AFFINITY_SIM_SEED", defaults.seed)?,
            locality: setting("AFFINITY_SIM_LOCALITY", defaults.locality)?,
            noise: setting("AFFINITY_SIM_NOISE", defaults.noise)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.nodes == 0 || self.communities == 0 || self.objects_per_community < 2 {
            return Err(SimError::InvalidConfig(
                "need at least one node, one community and two objects per community".to_string(),
            ));
        }
        if self.community_size < 2 {
            return Err(SimError::InvalidConfig("communities need two members".to_string()));
        }
        for (name, p) in [("locality", self.locality), ("noise", self.noise)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(SimError::InvalidConfig(format!("{name} {p} is not a probability")));
            }
        }
        Ok(())
    }
}

fn setting<T: FromStr>(key: &str, default: T) -> Result<T, SimError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SimError::InvalidConfig(format!("{key}={raw}"))),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
struct Community {
    /// (member, index of the node it lives on)
    members: Vec<(Identity, usize)>,
    objects: Vec<ObjectId>,
}

/// Generates access reports for every node's listener.
#[derive(Debug)]
pub struct Workload {
    rng: StdRng,
    noise: f64,
    communities: Vec<Community>,
    object_home: HashMap<ObjectId, usize>,
}

impl Workload {
    pub fn new(config: &SimConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut object_home = HashMap::new();
        let communities = (0..config.communities)
            .map(|c| {
                let home = c % config.nodes;
                let base = (c as u64 + 1) * 1000;
                let members = (0..config.community_size)
                    .map(|i| {
                        let node = if rng.gen_bool(config.locality) {
                            home
                        } else {
                            rng.gen_range(0..config.nodes)
                        };
                        (Identity::new(base + i as u64), node)
                    })
                    .collect();
                let objects: Vec<ObjectId> = (0..config.objects_per_community)
                    .map(|j| ObjectId(base + j as u64))
                    .collect();
                for object in &objects {
                    object_home.insert(*object, home);
                }
                Community { members, objects }
            })
            .collect();
        Self {
            rng,
            noise: config.noise,
            communities,
            object_home,
        }
    }

    /// The communities the workload was generated from.
    pub fn planted(&self) -> Result<Vec<AffinityGroup>, SimError> {
        self.communities
            .iter()
            .enumerate()
            .map(|(c, community)| {
                let members: BTreeSet<Identity> = community.members.iter().map(|(m, _)| *m).collect();
                Ok(AffinityGroup::new(c as u64, 0, members)?)
            })
            .collect()
    }

    /// One round of accesses. Accesses to objects homed elsewhere are
    /// recorded as conflicts with the home node.
    pub fn drive(&mut self, services: &[AffinityService]) -> Result<usize, SimError> {
        let mut reports = 0;
        for c in 0..self.communities.len() {
            for m in 0..self.communities[c].members.len() {
                let (owner, node) = self.communities[c].members[m];
                let (detail, touched) = self.accesses(c)?;
                let service = &services[node];
                let (Some(listener), Some(builder)) = (service.listener(), service.builder()) else {
                    continue;
                };
                listener.report(owner, &detail)?;
                for object in touched {
                    let home = self.object_home.get(&object).copied().unwrap_or(node);
                    if home != node {
                        builder.note_conflict_detected(object, services[home].node(), false)?;
                    }
                }
                reports += 1;
            }
        }
        debug!(reports, "workload round delivered");
        Ok(reports)
    }

    fn accesses(&mut self, community: usize) -> Result<(AccessDetail, Vec<ObjectId>), SimError> {
        let own = &self.communities[community].objects;
        let mut touched: Vec<ObjectId> = own.choose_multiple(&mut self.rng, 2).copied().collect();
        if self.communities.len() > 1 && self.rng.gen_bool(self.noise) {
            let mut other = self.rng.gen_range(0..self.communities.len() - 1);
            if other >= community {
                other += 1;
            }
            if let Some(object) = self.communities[other].objects.choose(&mut self.rng) {
                touched.push(*object);
            }
        }
        let mut detail = AccessDetail::new();
        for object in &touched {
            detail.access_times(*object, self.rng.gen_range(1..=3))?;
        }
        Ok((detail, touched))
    }
}
