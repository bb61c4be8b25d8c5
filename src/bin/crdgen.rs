use cassandra_k8s::crd::CassandraDatacenter;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&CassandraDatacenter::crd())?);
    Ok(())
}
