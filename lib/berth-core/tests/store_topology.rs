use std::{path::PathBuf, time::Duration};

use berth_core::topology::{MountSource, ProbeCheck, ServiceName, ServiceSource, Topology, TopologyLoader};

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/store/berth.yaml")
}

fn load_demo() -> Topology {
    TopologyLoader::load(demo_path()).expect("demo topology should be valid")
}

fn names(names: &[&str]) -> Vec<ServiceName> {
    names.iter().map(|name| ServiceName::try_from(*name).unwrap()).collect()
}

#[test]
fn activation_order() {
    let topology = load_demo();

    assert_eq!(topology.project(), "store");
    similar_asserts::assert_eq!(topology.activation_order(), names(&["db", "redis", "web", "worker"]).as_slice());
    similar_asserts::assert_eq!(
        topology.graph().transitive_dependents("db"),
        names(&["web", "worker"])
    );
}

#[test]
fn server_and_worker_share_one_build() {
    let topology = load_demo();
    let web = topology.service("web").unwrap();
    let worker = topology.service("worker").unwrap();

    match (&web.source, &worker.source) {
        (ServiceSource::Build(web_recipe), ServiceSource::Build(worker_recipe)) => {
            assert_eq!(web_recipe, worker_recipe);
            assert_eq!(web_recipe.prepare.as_deref(), Some("python manage.py collectstatic --noinput"));
            assert!(web_recipe.context.join("requirements.txt").is_file());
        }
        other => panic!("unexpected sources: {:?}", other),
    }
}

#[test]
fn shared_configuration_is_identical() {
    let topology = load_demo();
    let source = topology.configs().next().unwrap();
    assert_eq!(source.name(), "app");

    for service in ["db", "web", "worker"] {
        let environment = &topology.service(service).unwrap().environment;
        for (key, value) in source.iter() {
            assert_eq!(
                environment.get(key).map(String::as_str),
                Some(value),
                "'{}' sees a different {}",
                service,
                key
            );
        }
    }

    let worker = topology.service("worker").unwrap();
    assert_eq!(worker.environment.get("C_FORCE_ROOT").map(String::as_str), Some("true"));
    assert_eq!(worker.environment.get("DJANGO_SECRET_KEY").map(String::as_str), Some("change-me"));
}

#[test]
fn probes_and_mounts() {
    let topology = load_demo();

    let web = topology.service("web").unwrap();
    let probe = web.readiness.as_ref().unwrap();
    match &probe.check {
        ProbeCheck::Exec(argv) => {
            assert_eq!(argv[..2], ["python", "-c"]);
            assert!(argv[2].contains("http://127.0.0.1:8000/"));
        }
        other => panic!("expected an application-level check, got {:?}", other),
    }
    assert_eq!(probe.start_period, Duration::from_secs(2));
    assert_eq!(probe.retries, 30);

    assert!(topology.service("worker").unwrap().readiness.is_none());

    let worker_media = &topology.service("worker").unwrap().volumes[0];
    assert!(worker_media.read_only);
    assert!(matches!(&worker_media.source, MountSource::Bind(path) if path.ends_with("media")));

    let db = topology.service("db").unwrap();
    assert_eq!(db.named_volumes().collect::<Vec<_>>(), vec!["postgres_data"]);
}
