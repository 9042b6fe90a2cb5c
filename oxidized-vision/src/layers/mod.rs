pub mod activation;

pub mod attention;

pub mod batch_norm;

pub mod build_module;

pub mod conv;

pub mod data_format;

pub mod dropout;

pub mod feedforward;

pub mod identity;

pub mod init;

pub mod layer_norm;

pub mod layer_scale;

pub mod make_divisible;

pub mod pooling;

pub mod regularizer;

pub mod squeeze_excitation;

pub mod stochastic_depth;
