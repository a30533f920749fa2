use shmap::core::ops::{MulOp, PsumOp, ReduceSumOp};
use shmap::*;

/// Scales every row of `x` by `w`, sums the rows on each device, and sums the partial results across devices.
fn body(builder: &mut GraphBuilder, inputs: &[AtomId]) -> Result<Vec<Atom>, Error> {
    let scaled = builder.add_equation(MulOp, vec![inputs[0].into(), inputs[1].into()])?[0];
    let partial = builder.add_equation(ReduceSumOp::new(vec![0]), vec![scaled.into()])?[0];
    let total = builder.add_equation(PsumOp::new(["data"]), vec![partial.into()])?[0];
    Ok(vec![total.into()])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let mesh = Mesh::local(vec![MeshAxis::new("data", 4)?])?;
    let spec = ShardMapSpec::new(
        mesh,
        vec![PartitionSpec::new(vec![PartitionDimension::sharded("data")]), PartitionSpec::replicated(1)],
        vec![PartitionSpec::replicated(1)],
    );

    let mut builder = GraphBuilder::new();
    let x = builder.add_variable(ArrayType::new(DataType::Float32, Shape::of(&[8, 4])));
    let w = builder.add_variable(ArrayType::new(DataType::Float32, Shape::of(&[4])));
    let outputs = shard_map(&mut builder, &spec, &[x.into(), w.into()], body)?;
    let graph = builder.build(vec![x, w], outputs.into_iter().map(Atom::from).collect())?;
    println!("{graph}");

    let x = HostArray::new(DataType::Float32, vec![8, 4], (0..32).map(|value| value as f64).collect())?;
    let w = HostArray::new(DataType::Float32, vec![4], vec![1.0, 0.5, 0.25, 0.0])?;
    let outputs = shard_map_eager(&spec, &[GlobalArray::host(x), GlobalArray::host(w)], body)?;
    println!("{}", outputs[0].array);
    Ok(())
}
