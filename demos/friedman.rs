use nngls::metrics::{q2, rmse};
use nngls::simulation::{FieldSampling, simulate, train_valid_test_split};
use nngls::{
    Activation, CovParams, ExponentialCov, LinearBasis, LinearMean, MeanFunction, Mlp, Nngls,
    SpatialData, VecchiaMle,
};

fn centered(data: &SpatialData<f64>, offset: f64) -> SpatialData<f64> {
    SpatialData::new(
        data.x().to_owned(),
        data.coords().to_owned(),
        data.y().mapv(|v| v - offset),
    )
    .expect("Centered dataset")
}

fn main() {
    let theta = CovParams::new(1., 3. / 2f64.sqrt(), 0.01).expect("Covariance parameters");
    let data = simulate(1000, &ExponentialCov(), &theta, 10., FieldSampling::Nngp(20), 0)
        .expect("Friedman dataset");
    let (train, valid, test) = train_valid_test_split(&data, 0.2, 0.2, 1).expect("Data split");

    let offset = train.y().mean().expect("Non empty training data");
    let (train, valid, test) = (
        centered(&train, offset),
        centered(&valid, offset),
        centered(&test, offset),
    );

    let mlp = Mlp::new(5, &[32], Activation::Relu, 42).expect("Neural network");
    let model = Nngls::params(mlp, ExponentialCov(), VecchiaMle::default())
        .neighbor_size(20)
        .learning_rate(0.01)
        .max_epochs(500)
        .fit(&train, Some(&valid))
        .expect("NN-GLS training");
    println!("{model}");
    println!(
        "Trained {} epochs, best epoch = {:?}",
        model.history().len(),
        model.history().best_epoch()
    );

    let pred = model
        .predict_spatial(&test.x(), &test.coords())
        .expect("NN-GLS prediction");
    let ols = LinearMean::fit_ols(LinearBasis(), &train.x(), &train.y()).expect("OLS fitting");
    let ols_pred = ols.predict(&test.x());

    for (name, y) in [
        ("NN-GLS", &pred.total),
        ("NN-GLS mean only", &pred.mean),
        ("OLS", &ols_pred),
    ] {
        println!(
            "{name:>16}: rmse = {:.4}, q2 = {:.4}",
            rmse(y, &test.y()).expect("rmse"),
            q2(y, &test.y()).expect("q2")
        );
    }
}
