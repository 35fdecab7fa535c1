use crate::env::{EnvBuilder, Environment, HandleCounter, Observation};

use ndarray::Array;
use rand::rngs::StdRng;
use rand::Rng;
use std::fmt;

///
/// Multi-port container stowage bay.
///
/// A vessel visits `ports` ports in a fixed order. At each port the
/// containers listed in the transportation matrix are loaded into an
/// `rows` x `columns` bay of stacks; at arrival, containers destined for
/// the port are unloaded, and anything stacked on top of them is forced
/// off the vessel and back into the load queue. Actions either add the
/// next queued container to a column or remove the top of a column.
///
/// The action space is `2 * columns`: action `c` adds to column `c`,
/// action `columns + c` removes from column `c`. The episode value is the
/// negated total number of crane moves.
///
#[derive(Debug)]
pub struct StowageEnv {
    rows: usize,
    columns: usize,
    ports: usize,
    /// Stacks of destination ports, bottom first.
    bay: Vec<Vec<u8>>,
    /// Containers still to be loaded at the current port, per destination.
    queue: Vec<u32>,
    /// Remaining transportation demand, `transport[i][j]` = containers
    /// from port `i` to port `j`.
    transport: Vec<Vec<u32>>,
    port: usize,
    moves: u32,
    move_cap: u32,
    placed: u32,
    reshuffles: u32,
    reshuffles_this_port: u32,
    reshuffle_limit: i32,
    closed: bool,
    handles: HandleCounter,
}

impl StowageEnv {
    /// Create an episode with a random feasible transportation matrix.
    pub fn new(rows: usize, columns: usize, ports: usize, rng: &mut StdRng) -> Self {
        let capacity = rows * columns;
        let mut budget = capacity as u32;
        let mut transport = vec![vec![0u32; ports]; ports];
        for i in 0..ports.saturating_sub(1) {
            for j in (i + 1)..ports {
                if budget == 0 {
                    break;
                }
                let x = rng.gen_range(0, 3).min(budget);
                transport[i][j] = x;
                budget -= x;
            }
        }
        if transport.iter().flatten().all(|&x| x == 0) && capacity > 0 && ports > 1 {
            transport[0][ports - 1] = 1;
        }
        Self::from_transport(rows, columns, ports, transport)
    }

    /// Create an episode from an explicit transportation matrix.
    pub fn from_transport(
        rows: usize,
        columns: usize,
        ports: usize,
        transport: Vec<Vec<u32>>,
    ) -> Self {
        assert!(ports >= 2);
        assert_eq!(transport.len(), ports);
        let move_cap = (4 * rows * columns * ports) as u32;
        let mut env = StowageEnv {
            rows,
            columns,
            ports,
            bay: vec![Vec::with_capacity(rows); columns],
            queue: vec![0; ports],
            transport,
            port: 0,
            moves: 0,
            move_cap,
            placed: 0,
            reshuffles: 0,
            reshuffles_this_port: 0,
            reshuffle_limit: ((rows * columns) / 2) as i32,
            closed: false,
            handles: HandleCounter::new(),
        };
        env.load_queue_from_transport();
        env.advance_ports();
        env
    }

    /// Override the reshuffle floor used by the dominance bound.
    pub fn with_reshuffle_limit(mut self, limit: i32) -> Self {
        self.reshuffle_limit = limit;
        self
    }

    /// Containers placed into the bay so far.
    pub fn containers_placed(&self) -> u32 {
        self.placed
    }

    /// Crane moves spent so far.
    pub fn moves(&self) -> u32 {
        self.moves
    }

    /// Reshuffles charged at the current port.
    pub fn reshuffles_this_port(&self) -> u32 {
        self.reshuffles_this_port
    }

    /// Current port index.
    pub fn port(&self) -> usize {
        self.port
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.iter().all(|&x| x == 0)
    }

    /// Destination of the next container to load: nearest port first.
    fn next_destination(&self) -> Option<usize> {
        self.queue.iter().position(|&x| x > 0)
    }

    fn load_queue_from_transport(&mut self) {
        for j in 0..self.ports {
            self.queue[j] += self.transport[self.port][j];
            self.transport[self.port][j] = 0;
        }
    }

    /// Sail onward while there is nothing left to load at the current
    /// port. Arrival unloads delivered containers; blockers stacked above
    /// them are forced back into the queue, one reshuffle each.
    fn advance_ports(&mut self) {
        while self.queue_is_empty() && self.port + 1 < self.ports {
            self.port += 1;
            self.reshuffles_this_port = 0;
            for c in 0..self.columns {
                while self
                    .bay[c]
                    .iter()
                    .any(|&dest| dest as usize == self.port)
                {
                    let top = self.bay[c].pop().expect("non-empty column");
                    if top as usize == self.port {
                        continue;
                    }
                    self.queue[top as usize] += 1;
                    self.reshuffles += 1;
                    self.reshuffles_this_port += 1;
                }
            }
            self.load_queue_from_transport();
        }
    }
}

impl Clone for StowageEnv {
    fn clone(&self) -> Self {
        StowageEnv {
            rows: self.rows,
            columns: self.columns,
            ports: self.ports,
            bay: self.bay.clone(),
            queue: self.queue.clone(),
            transport: self.transport.clone(),
            port: self.port,
            moves: self.moves,
            move_cap: self.move_cap,
            placed: self.placed,
            reshuffles: self.reshuffles,
            reshuffles_this_port: self.reshuffles_this_port,
            reshuffle_limit: self.reshuffle_limit,
            closed: false,
            handles: self.handles.acquire(),
        }
    }
}

impl Drop for StowageEnv {
    fn drop(&mut self) {
        if !self.closed {
            if cfg!(debug_assertions) {
                log::debug!("stowage environment dropped without close");
            }
            self.handles.release();
        }
    }
}

impl Environment for StowageEnv {
    type Key = (u8, Vec<u8>, Vec<u32>);

    fn action_count(&self) -> usize {
        2 * self.columns
    }

    fn mask(&self) -> Vec<bool> {
        let mut mask = vec![false; 2 * self.columns];
        if self.is_terminal() {
            return mask;
        }
        let can_add = !self.queue_is_empty();
        for c in 0..self.columns {
            mask[c] = can_add && self.bay[c].len() < self.rows;
            mask[self.columns + c] = !self.bay[c].is_empty();
        }
        mask
    }

    fn step(&mut self, action: usize) {
        if action < self.columns {
            if let Some(dest) = self.next_destination() {
                self.queue[dest] -= 1;
                self.bay[action].push(dest as u8);
                self.placed += 1;
            }
        } else {
            let c = action - self.columns;
            if let Some(top) = self.bay[c].pop() {
                self.queue[top as usize] += 1;
                self.reshuffles += 1;
                self.reshuffles_this_port += 1;
            }
        }
        self.moves += 1;
        self.advance_ports();
    }

    fn is_terminal(&self) -> bool {
        self.moves >= self.move_cap || (self.port + 1 == self.ports && self.queue_is_empty())
    }

    fn observation(&self) -> Observation {
        let scale = self.ports as f32;
        let mut bay = Array::zeros(vec![self.rows, self.columns]);
        for (c, column) in self.bay.iter().enumerate() {
            for (r, &dest) in column.iter().enumerate() {
                bay[[r, c]] = (dest as f32 + 1.0) / scale;
            }
        }
        let mut schedule = Array::zeros(vec![self.ports, self.ports]);
        for (i, row) in self.transport.iter().enumerate() {
            for (j, &x) in row.iter().enumerate() {
                schedule[[i, j]] = x as f32;
            }
        }
        for (j, &x) in self.queue.iter().enumerate() {
            schedule[[self.port, j]] += x as f32;
        }
        let mask = Array::from(
            self.mask()
                .into_iter()
                .map(|m| if m { 1.0 } else { 0.0 })
                .collect::<Vec<f32>>(),
        )
        .into_dyn();
        Observation(vec![bay, schedule, mask])
    }

    fn final_value(&self) -> f32 {
        -(self.moves as f32)
    }

    fn worst_case_value(&self) -> f32 {
        -((self.ports * self.rows * self.columns) as f32)
    }

    fn cost_incurred(&self) -> f32 {
        self.placed as f32
    }

    fn total_reward(&self) -> f32 {
        -(self.reshuffles as f32)
    }

    fn violates_bound(&self) -> bool {
        self.reshuffles_this_port as i32 > self.reshuffle_limit
    }

    fn state_key(&self) -> Self::Key {
        let mut flat = Vec::with_capacity(self.columns * (self.rows + 1));
        for column in &self.bay {
            flat.extend_from_slice(column);
            flat.push(u8::max_value());
        }
        (self.port as u8, flat, self.queue.clone())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.handles.release();
        }
    }

    fn live_handles(&self) -> usize {
        self.handles.live()
    }
}

impl fmt::Display for StowageEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "port {}/{}", self.port, self.ports - 1)?;
        for r in (0..self.rows).rev() {
            for c in 0..self.columns {
                match self.bay[c].get(r) {
                    Some(dest) => write!(f, "[{}]", dest)?,
                    None => write!(f, " . ")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Builder for randomized stowage episodes.
#[derive(Clone, Debug)]
pub struct StowageBuilder {
    /// Bay rows.
    pub rows: usize,
    /// Bay columns.
    pub columns: usize,
    /// Ports on the route.
    pub ports: usize,
}

impl EnvBuilder for StowageBuilder {
    type Env = StowageEnv;

    fn build(&self, rng: &mut StdRng) -> StowageEnv {
        StowageEnv::new(self.rows, self.columns, self.ports, rng)
    }
}
