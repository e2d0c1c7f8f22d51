pub mod activation;

pub mod attention;

pub mod build_module;

pub mod dense;

pub mod dropout;

pub mod encoder_block;

pub mod feedforward;

pub mod identity;

pub mod initializer;

pub mod layer_norm;
