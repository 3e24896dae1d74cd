pub mod config;
pub mod nonstandard;
pub mod records;
pub mod snapshot;

pub mod phase0 {
    pub mod consts;
    pub mod containers;
    pub mod primitives;
}

pub mod altair {
    pub mod consts;
    pub mod containers;
}

pub mod capella {
    pub mod containers;
}
