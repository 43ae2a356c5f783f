//! The shipped rig configuration loads and matches the built-in defaults.

use spim_daq::config::RigConfig;
use spim_daq::timing::TimingProgramCompiler;
use spim_daq::AcquisitionParameters;

fn shipped_config() -> RigConfig {
    RigConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/rig.toml"))
        .expect("config/rig.toml should load")
}

#[test]
fn test_shipped_config_matches_defaults() {
    assert_eq!(shipped_config(), RigConfig::default());
}

#[test]
fn test_shipped_config_compiles_default_parameters() {
    let config = shipped_config();
    let compiler = TimingProgramCompiler::new(config.logic.clone(), config.scan.clone());
    let (program, scan) = compiler
        .compile(&AcquisitionParameters::default(), &config.calibration)
        .unwrap();
    assert_eq!(program.cells().len(), 2);
    assert_eq!(program.routes().len(), 2);
    assert_eq!(scan.slice_count_for_controller, 3);
}
