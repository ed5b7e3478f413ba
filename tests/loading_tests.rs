//! Configuration and program files

mod common;
use common::counter_loop;
use quicktrace::bytecode::{assemble, disassemble_program, Program};
use quicktrace::{Interpreter, JitConfig, Value};
use std::io::Write;
use tempfile::{Builder, NamedTempFile};

fn file_with(suffix: &str, bytes: &[u8]) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

mod config {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let file = file_with(".json", br#"{ "hot_threshold": 2, "dump_ir": true }"#);
        let config = JitConfig::load(file.path()).unwrap();
        assert_eq!(config.hot_threshold, 2);
        assert!(config.dump_ir);
        assert_eq!(config.max_trace_length, JitConfig::default().max_trace_length);
        assert!(config.enabled);
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        let file = file_with(
            ".json",
            br#"{ "min_trace_length": 64, "max_trace_length": 32 }"#,
        );
        let err = JitConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("min_trace_length"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JitConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_loaded_config_drives_engine() {
        let file = file_with(".json", br#"{ "hot_threshold": 50 }"#);
        let config = JitConfig::load(file.path()).unwrap();
        let mut interp = Interpreter::with_jit(config).unwrap();
        interp.eval(&counter_loop(50)).unwrap();
        assert_eq!(interp.jit_stats().unwrap().recordings_started, 0);
    }
}

mod programs {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(program: &Program) -> Value {
        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        interp.load(program).unwrap();
        interp.run().unwrap()
    }

    #[test]
    fn test_assembly_file() {
        let file = file_with(".qasm", counter_loop(200).as_bytes());
        let program = Program::load(file.path()).unwrap();
        assert_eq!(run(&program), Value::Fixnum(200));
    }

    #[test]
    fn test_json_file() {
        let program = assemble(&counter_loop(300)).unwrap();
        let file = file_with(".json", program.to_json_string().unwrap().as_bytes());
        let loaded = Program::load(file.path()).unwrap();
        assert_eq!(disassemble_program(&loaded), disassemble_program(&program));
        assert_eq!(run(&loaded), Value::Fixnum(300));
    }

    #[test]
    fn test_binary_image() {
        let program = quicktrace::demos::find("points").unwrap().program().unwrap();
        let file = file_with(".qtb", &program.to_image().unwrap());
        let loaded = Program::load(file.path()).unwrap();
        assert_eq!(disassemble_program(&loaded), disassemble_program(&program));
        assert_eq!(run(&loaded), Value::Fixnum(2000));
    }

    #[test]
    fn test_truncated_image_rejected() {
        let program = assemble(&counter_loop(10)).unwrap();
        let image = program.to_image().unwrap();
        let file = file_with(".qtb", &image[..image.len() / 2]);
        assert!(Program::load(file.path()).is_err());
    }

    #[test]
    fn test_bad_assembly_reports_line() {
        let file = file_with(".qasm", b"top main\n  putobject 1\n  frobnicate\n  leave\nend\n");
        let err = Program::load(file.path()).unwrap_err().to_string();
        assert!(err.contains("line 3"), "{}", err);
    }
}
