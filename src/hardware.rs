//! Modelo determinista del hardware de laboratorio.
//!
//! Tanto la máquina virtual de referencia como el evaluador de
//! referencia consultan este mismo modelo para toda lectura que en el
//! hardware real sería externa: el pipe de puntos de barrido, los
//! contadores de fotones, la RAM y el generador de números aleatorios.
//! Con una semilla fija, ambas rutas observan exactamente los mismos
//! valores y las comparaciones entre ejecuciones son estables.

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Semilla fija del generador pseudoaleatorio.
pub const FIXED_SEED: u64 = 0x1d0a_7e57_5eed;

/// Cantidad de palabras disponibles en el pipe de entrada.
pub const PIPE_DEPTH: usize = 4;

/// Cantidad de lecturas de RAM válidas antes de agotarse.
pub const RAM_DEPTH: usize = 8;

pub struct FakeHardware {
    rng: StdRng,
    pipe_remaining: usize,
    ram_remaining: usize,
}

impl FakeHardware {
    pub fn new() -> Self {
        FakeHardware {
            rng: StdRng::seed_from_u64(FIXED_SEED),
            pipe_remaining: PIPE_DEPTH,
            ram_remaining: RAM_DEPTH,
        }
    }

    /// Lee la siguiente palabra del pipe; cero cuando está vacío.
    pub fn read_pipe(&mut self) -> u64 {
        if self.pipe_remaining == 0 {
            return 0;
        }

        self.pipe_remaining -= 1;
        self.next()
    }

    pub fn pipe_empty(&self) -> bool {
        self.pipe_remaining == 0
    }

    pub fn ram_valid(&self) -> bool {
        self.ram_remaining > 0
    }

    pub fn read_ram(&mut self) -> u64 {
        if self.ram_remaining > 0 {
            self.ram_remaining -= 1;
        }

        self.next()
    }

    /// Valor del contador de fotones indicado.
    pub fn load_count(&mut self, _channel: u64) -> u64 {
        self.next()
    }

    pub fn rand(&mut self) -> u64 {
        self.next()
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    // Se limita a 32 bits para que los valores queden lejos del borde
    // de overflow de la aritmética de palabra
    fn next(&mut self) -> u64 {
        self.rng.gen::<u32>() as u64
    }
}

impl Default for FakeHardware {
    fn default() -> Self {
        FakeHardware::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_reproducible() {
        let mut first = FakeHardware::new();
        let mut second = FakeHardware::new();

        let a: Vec<u64> = (0..8).map(|_| first.rand()).collect();
        let b: Vec<u64> = (0..8).map(|_| second.rand()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn pipe_exhausts_after_its_depth() {
        let mut hardware = FakeHardware::new();
        assert!(!hardware.pipe_empty());

        for _ in 0..PIPE_DEPTH {
            hardware.read_pipe();
        }

        assert!(hardware.pipe_empty());
        assert_eq!(hardware.read_pipe(), 0);
    }

    #[test]
    fn reseeding_restarts_the_stream() {
        let mut hardware = FakeHardware::new();
        let first = hardware.rand();

        hardware.reseed(FIXED_SEED);
        assert_eq!(hardware.rand(), first);
    }
}
