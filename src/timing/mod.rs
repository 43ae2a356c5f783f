//! Logic-card timing programs and the compiler that produces them.

pub mod compiler;
pub mod program;

pub use compiler::{compile, cycles_to_ms, ms_to_cycles, LogicLayout, TimingProgramCompiler};
pub use program::{
    CellId, CellKind, LogicCell, LogicProgram, OutputPort, PortRoute, ScanGeometry,
    ScanParameters, ScanSide, SignalAddress,
};
