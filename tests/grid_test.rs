//! Integration tests for grid job descriptions and the service registry.

use labpipe::grid::{GridJob, GridServiceRegistry};
use tempfile::TempDir;

#[test]
fn qsub_line_quotes_the_working_folder() {
    let job = GridJob::new("application")
        .args(["-p", "-q"])
        .priority(-5)
        .queue("all.q")
        .memory_mb("123")
        .native_spec("-j yes")
        .working_folder("working folder/with spc's");

    assert_eq!(
        job.qsub_command(),
        r"qsub -q all.q -wd 'working folder/with spc\'s' -l s_vmem=123M -p -5 -j yes application -p -q"
    );
    assert_eq!(job.to_string(), job.qsub_command());
}

#[test]
fn empty_native_spec_is_left_out() {
    let job = GridJob::new("msconvert").working_folder("/scratch");
    assert_eq!(
        job.qsub_command(),
        "qsub -q all.q -wd '/scratch' -l s_vmem=0M -p 0 msconvert"
    );
}

#[test]
fn jobs_get_distinct_ids_and_log_names() {
    let first = GridJob::new("a").log_folder("/logs");
    let second = GridJob::new("a");

    assert_ne!(first.id(), second.id());
    assert_eq!(
        first.output_log_file().unwrap(),
        std::path::Path::new("/logs").join(format!("o{}.sge.log", first.id()))
    );
    assert_eq!(
        first.error_log_file().unwrap(),
        std::path::Path::new("/logs").join(format!("e{}.sge.log", first.id()))
    );
    assert_eq!(second.output_log_file(), None);
}

#[test]
fn registry_loads_service_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tandem.toml"),
        r#"
[service]
name = "tandem"
application = "/opt/tandem/bin/tandem"
memory_mb = "4096"
priority = -2
working_folder = "/scratch/tandem"
"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"not a service").unwrap();

    let registry = GridServiceRegistry::load_from_dir(dir.path()).unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.get("omssa").is_none());

    let service = registry.get("tandem").unwrap();
    assert_eq!(service.queue, "all.q");
    assert_eq!(
        service.job(["input.xml"]).qsub_command(),
        "qsub -q all.q -wd '/scratch/tandem' -l s_vmem=4096M -p -2 /opt/tandem/bin/tandem input.xml"
    );
}

#[test]
fn malformed_service_files_are_config_errors() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken.toml"), "[service]\nname = 3\n").unwrap();

    let result = GridServiceRegistry::load_from_dir(dir.path());
    assert!(matches!(result, Err(labpipe::error::Error::Config(_))));
}
