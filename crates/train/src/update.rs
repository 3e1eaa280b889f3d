//! Manual primary-network update.
//!
//! The primary network has no optimiser: after the meta-gradients are written
//! into the gradient store, every variable that carries a gradient moves by
//! `−lr · grad`. Nothing here touches the meta optimiser's moment state.

use candle_core::{backprop::GradStore, Var};

use metaquant_core::{MetaGradMap, PrimaryNet};

/// `param -= lr * grad` for every variable with a gradient in `grads`.
/// Returns the number of variables updated.
pub fn update_parameters(vars: &[Var], grads: &GradStore, lr: f64) -> anyhow::Result<usize> {
    let mut updated = 0;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let next = (var.as_tensor().detach() - g.affine(lr, 0.0)?)?;
            var.set(&next)?;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Replace each layer's latent-weight gradient with
/// `calibration * transformed_gradient`. Every layer must have a record.
pub fn assign_meta_gradients(
    net: &PrimaryNet,
    map: &MetaGradMap,
    grads: &mut GradStore,
) -> anyhow::Result<()> {
    for layer in net.layers() {
        let Some(record) = map.get(layer.name()) else {
            anyhow::bail!("no meta-gradient for layer {}", layer.name());
        };
        layer.assign_gradient(record, grads)?;
    }
    Ok(())
}

/// Drop gradients of frozen tensors before a raw-gradient update.
pub fn retain_trainable_grads(net: &PrimaryNet, grads: &mut GradStore) {
    for layer in net.layers() {
        layer.retain_trainable_grads(grads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use metaquant_common::{MetaMethod, MetaNetConfig, MetaQuantConfig, ModelKind, QuantScheme};
    use metaquant_core::{build_network, ForwardArgs, MetaNet};

    use crate::orchestrator::{generate_meta_gradients, GenerationOptions, LayerStates};

    fn vec1(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn update_moves_against_gradient() {
        let dev = Device::Cpu;
        let var = Var::new(&[1.0f32, -2.0], &dev).unwrap();
        let untouched = Var::new(&[5.0f32], &dev).unwrap();
        let grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        let n = update_parameters(&[var.clone(), untouched.clone()], &grads, 0.5).unwrap();
        assert_eq!(n, 1);
        assert_eq!(vec1(var.as_tensor()), vec![0.5, -2.5]);
        assert_eq!(vec1(untouched.as_tensor()), vec![5.0]);
    }

    /// Two bias-free layers `2 → 1 → 2`, constant-scale meta-network with
    /// `alpha = 2`, raw gradient of ones on the first layer.
    #[test]
    fn constant_scale_end_to_end() {
        let dev = Device::Cpu;
        let config = MetaQuantConfig {
            model: ModelKind::Mlp,
            num_classes: 2,
            input_shape: [2, 1, 1],
            mlp_hidden: vec![1],
            mlp_bias: false,
            quantize: QuantScheme::Dorefa,
            meta: MetaNetConfig {
                method: MetaMethod::ConstantScale,
                scale_init: 2.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let primary = VarMap::new();
        let net =
            build_network(&config, VarBuilder::from_varmap(&primary, DType::F32, &dev)).unwrap();
        let meta_vars = VarMap::new();
        let meta = MetaNet::for_method(
            &config.meta,
            VarBuilder::from_varmap(&meta_vars, DType::F32, &dev),
        )
        .unwrap();

        let x = Tensor::ones((1, 2, 1, 1), DType::F32, &dev).unwrap();
        let y = net.forward(&x, &ForwardArgs::eval(config.quantize)).unwrap();
        let mut grads = y.sum_all().unwrap().backward().unwrap();
        net.capture_grads(&grads);

        let fc0 = net.layer(0).unwrap();
        fc0.record_gradients(Tensor::ones((1, 2), DType::F32, &dev).unwrap(), None);

        let opts = GenerationOptions {
            method: MetaMethod::ConstantScale,
            fix_meta: false,
            history_window: 5,
        };
        let (map, _) = generate_meta_gradients(&meta, &net, &opts, &LayerStates::default()).unwrap();
        let transformed = map["fc0"].weight_grad.dense().unwrap();
        assert_eq!(transformed.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0]]);

        let w_before = vec1(fc0.weight());
        let calibration = vec1(&fc0.calibration().unwrap().to_tensor(fc0.weight()).unwrap());
        assign_meta_gradients(&net, &map, &mut grads).unwrap();
        update_parameters(&primary.all_vars(), &grads, 0.1).unwrap();
        let w_after = vec1(fc0.weight());

        for ((after, before), cal) in w_after.iter().zip(&w_before).zip(&calibration) {
            let expected = before - 0.1 * 2.0 * cal;
            assert!((after - expected).abs() < 1e-6, "{after} vs {expected}");
        }
    }

    #[test]
    fn missing_record_is_rejected() {
        let dev = Device::Cpu;
        let config = MetaQuantConfig {
            model: ModelKind::Mlp,
            input_shape: [1, 2, 1],
            mlp_hidden: vec![],
            ..Default::default()
        };
        let primary = VarMap::new();
        let net =
            build_network(&config, VarBuilder::from_varmap(&primary, DType::F32, &dev)).unwrap();
        let x = Tensor::ones((1, 1, 2, 1), DType::F32, &dev).unwrap();
        let y = net.forward(&x, &ForwardArgs::eval(config.quantize)).unwrap();
        let mut grads = y.sum_all().unwrap().backward().unwrap();
        assert!(assign_meta_gradients(&net, &MetaGradMap::new(), &mut grads).is_err());
    }
}
