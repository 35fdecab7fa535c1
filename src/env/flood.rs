use crate::env::{EnvBuilder, Environment, HandleCounter, Observation};

use ansi_term::Colour::Fixed;
use ndarray::Array;
use rand::rngs::StdRng;
use rand::Rng;
use std::fmt;

/// Terminal palette for up to eight colors.
const PALETTE: [u8; 8] = [9, 12, 10, 11, 13, 14, 15, 8];

///
/// Flood-It board.
///
/// The player owns the flood region containing the origin cell and
/// repeatedly recolors it, absorbing adjacent cells of the chosen color,
/// until the whole board is one color. An action is any color different
/// from the current region color. The episode value is the negated number
/// of moves spent.
///
#[derive(Debug)]
pub struct FloodEnv {
    width: usize,
    height: usize,
    n_colors: usize,
    cells: Vec<u8>,
    moves: u32,
    move_cap: u32,
    handles: HandleCounter,
    closed: bool,
}

impl FloodEnv {
    /// Create a board with uniformly random cells.
    pub fn new(width: usize, height: usize, n_colors: usize, rng: &mut StdRng) -> Self {
        let cells = (0..width * height)
            .map(|_| rng.gen_range(0, n_colors) as u8)
            .collect();
        Self::from_cells(width, height, n_colors, cells)
    }

    /// Create a board from explicit cells, row-major.
    pub fn from_cells(width: usize, height: usize, n_colors: usize, cells: Vec<u8>) -> Self {
        assert_eq!(cells.len(), width * height);
        let move_cap = (width * height * n_colors) as u32;
        FloodEnv {
            width,
            height,
            n_colors,
            cells,
            moves: 0,
            move_cap,
            handles: HandleCounter::new(),
            closed: false,
        }
    }

    /// Number of moves played so far.
    pub fn moves(&self) -> u32 {
        self.moves
    }

    /// Color of the origin flood region.
    pub fn region_color(&self) -> u8 {
        self.cells[0]
    }

    fn monochrome(&self) -> bool {
        let first = self.cells[0];
        self.cells.iter().all(|&c| c == first)
    }

    /// Recolor the origin region, absorbing newly connected cells of the
    /// target color.
    fn flood(&mut self, color: u8) {
        let old = self.cells[0];
        if old == color {
            return;
        }
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            if self.cells[idx] != old {
                continue;
            }
            self.cells[idx] = color;
            let (x, y) = (idx % self.width, idx / self.width);
            if x > 0 {
                stack.push(idx - 1);
            }
            if x + 1 < self.width {
                stack.push(idx + 1);
            }
            if y > 0 {
                stack.push(idx - self.width);
            }
            if y + 1 < self.height {
                stack.push(idx + self.width);
            }
        }
    }
}

impl Clone for FloodEnv {
    fn clone(&self) -> Self {
        FloodEnv {
            width: self.width,
            height: self.height,
            n_colors: self.n_colors,
            cells: self.cells.clone(),
            moves: self.moves,
            move_cap: self.move_cap,
            handles: self.handles.acquire(),
            closed: false,
        }
    }
}

impl Drop for FloodEnv {
    fn drop(&mut self) {
        if !self.closed {
            if cfg!(debug_assertions) {
                log::debug!("flood environment dropped without close");
            }
            self.handles.release();
        }
    }
}

impl Environment for FloodEnv {
    type Key = Vec<u8>;

    fn action_count(&self) -> usize {
        self.n_colors
    }

    fn mask(&self) -> Vec<bool> {
        if self.is_terminal() {
            return vec![false; self.n_colors];
        }
        let region = self.region_color();
        (0..self.n_colors).map(|c| c as u8 != region).collect()
    }

    fn step(&mut self, action: usize) {
        self.flood(action as u8);
        self.moves += 1;
    }

    fn is_terminal(&self) -> bool {
        self.moves >= self.move_cap || self.monochrome()
    }

    fn observation(&self) -> Observation {
        let mut planes = Array::zeros(vec![self.n_colors, self.height, self.width]);
        for (idx, &c) in self.cells.iter().enumerate() {
            let (x, y) = (idx % self.width, idx / self.width);
            planes[[c as usize, y, x]] = 1.0;
        }
        Observation(vec![planes])
    }

    fn final_value(&self) -> f32 {
        -(self.moves as f32)
    }

    fn worst_case_value(&self) -> f32 {
        -(self.move_cap as f32)
    }

    fn cost_incurred(&self) -> f32 {
        // The value head is trained on remaining moves, so backed-up
        // estimates need no frame correction.
        0.0
    }

    fn state_key(&self) -> Vec<u8> {
        self.cells.clone()
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

impl fmt::Display for FloodEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for y in 0..self.height {
            for x in 0..self.width {
                let c = self.cells[y * self.width + x];
                let style = Fixed(PALETTE[c as usize % PALETTE.len()]);
                write!(f, "{}", style.paint("▓▓"))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Builder for randomized Flood-It boards.
#[derive(Clone, Debug)]
pub struct FloodBuilder {
    /// Board width.
    pub width: usize,
    /// Board height.
    pub height: usize,
    /// Number of colors.
    pub colors: usize,
}

impl EnvBuilder for FloodBuilder {
    type Env = FloodEnv;

    fn build(&self, rng: &mut StdRng) -> FloodEnv {
        FloodEnv::new(self.width, self.height, self.colors, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_absorbs_connected_cells() {
        // 1 0
        // 0 1
        let mut env = FloodEnv::from_cells(2, 2, 2, vec![1, 0, 0, 1]);
        env.step(0);
        assert_eq!(env.state_key(), vec![0, 0, 0, 1]);
        assert_eq!(env.moves(), 1);
        assert!(!env.is_terminal());

        env.step(1);
        assert_eq!(env.state_key(), vec![1, 1, 1, 1]);
        assert!(env.is_terminal());
        assert_eq!(env.final_value(), -2.0);
        env.close();
    }

    #[test]
    fn mask_excludes_region_color_and_terminal_states() {
        let mut env = FloodEnv::from_cells(2, 1, 3, vec![2, 0]);
        assert_eq!(env.mask(), vec![true, true, false]);

        env.step(0);
        assert!(env.is_terminal());
        assert_eq!(env.mask(), vec![false, false, false]);
        env.close();
    }

    #[test]
    fn single_cell_board_is_terminal_at_start() {
        let mut env = FloodEnv::from_cells(1, 1, 1, vec![0]);
        assert!(env.is_terminal());
        assert_eq!(env.mask(), vec![false]);
        assert_eq!(env.final_value(), 0.0);
        env.close();
    }

    #[test]
    fn copies_share_the_handle_count() {
        let mut env = FloodEnv::from_cells(2, 2, 2, vec![0, 1, 1, 0]);
        let mut copy = env.clone();
        assert_eq!(env.live_handles(), 2);
        copy.step(1);
        // The original is untouched by the copy's step.
        assert_eq!(env.state_key(), vec![0, 1, 1, 0]);
        copy.close();
        assert_eq!(env.live_handles(), 1);
        env.close();
        assert_eq!(env.live_handles(), 0);
        // A second close must not double-release.
        env.close();
        assert_eq!(env.live_handles(), 0);
    }

    #[test]
    fn observation_is_one_hot_per_color() {
        let env = {
            let mut e = FloodEnv::from_cells(2, 1, 2, vec![0, 1]);
            e.close();
            e
        };
        let Observation(parts) = env.observation();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].shape(), &[2, 1, 2]);
        assert_eq!(parts[0][[0, 0, 0]], 1.0);
        assert_eq!(parts[0][[1, 0, 1]], 1.0);
        assert_eq!(parts[0].sum(), 2.0);
    }
}
